//! OpenTelemetry instruments for the experiment loop.
//!
//! Registered against the global meter; they are no-ops until a service
//! installs a meter provider.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use std::time::Duration;

pub struct ExperimentMetrics {
    pub rounds_total: Counter<u64>,
    pub clients_sampled_total: Counter<u64>,
    pub evaluations_total: Counter<u64>,
    pub round_latency_ms: Histogram<f64>,
    pub evaluation_latency_ms: Histogram<f64>,
}

static FEDSIM_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("fedsim"));

pub static EXPERIMENT_METRICS: Lazy<ExperimentMetrics> = Lazy::new(|| ExperimentMetrics {
    rounds_total: FEDSIM_METER.u64_counter("fedsim_rounds_total").with_description("Federated rounds completed").build(),
    clients_sampled_total: FEDSIM_METER.u64_counter("fedsim_clients_sampled_total").with_description("Client participations across all rounds").build(),
    evaluations_total: FEDSIM_METER.u64_counter("fedsim_evaluations_total").with_description("Validation and test passes").build(),
    round_latency_ms: FEDSIM_METER.f64_histogram("fedsim_round_latency_ms").with_description("Wall time of one round (sample + next)").with_unit("ms").build(),
    evaluation_latency_ms: FEDSIM_METER.f64_histogram("fedsim_evaluation_latency_ms").with_description("Wall time of one evaluation pass").with_unit("ms").build(),
});

impl ExperimentMetrics {
    pub fn record_round(&self, clients: usize, elapsed: Duration) {
        self.rounds_total.add(1, &[]);
        self.clients_sampled_total.add(clients as u64, &[]);
        self.round_latency_ms.record(elapsed.as_secs_f64() * 1000.0, &[]);
    }

    pub fn record_evaluation(&self, evaluator: &str, elapsed: Duration) {
        let attrs = [KeyValue::new("evaluator", evaluator.to_string())];
        self.evaluations_total.add(1, &attrs);
        self.evaluation_latency_ms.record(elapsed.as_secs_f64() * 1000.0, &attrs);
    }
}
