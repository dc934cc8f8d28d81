//! Sequential round loop shared by every task.
//!
//! Each round samples clients, borrows their datasets from the provider,
//! hands the current state to the process and keeps the state it returns.
//! Round `r + 1` starts only after round `r`'s state has been replaced.

use std::fmt::Debug;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use super::process::{ClientDataset, DatasetProvider, IterativeProcess};
use super::sampler::{ClientId, ClientSampler};
use crate::error::{FedError, Result};
use crate::evaluation::{EvalMetrics, EvaluationSchedule, StateEvaluator};
use crate::metrics_ext::EXPERIMENT_METRICS;

#[derive(Debug)]
pub struct RoundReport<'a, M> {
    pub round: u64,
    pub client_ids: &'a [ClientId],
    pub metrics: &'a M,
    pub validation: Option<&'a EvalMetrics>,
    pub elapsed: Duration,
    /// Unix seconds at which the round's observers were notified.
    pub completed_at: i64,
}

pub trait RoundObserver<M> {
    fn on_round_end(&self, report: &RoundReport<'_, M>);
}

/// Logs every round at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl<M: Debug> RoundObserver<M> for LoggingObserver {
    fn on_round_end(&self, report: &RoundReport<'_, M>) {
        info!(
            round = report.round,
            clients = ?report.client_ids,
            metrics = ?report.metrics,
            validation = ?report.validation,
            elapsed_ms = report.elapsed.as_millis() as u64,
            completed_at = report.completed_at,
            "round_complete"
        );
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationEntry {
    pub round: u64,
    pub metrics: EvalMetrics,
}

/// Keeps the validation results of evaluated rounds.
#[derive(Debug, Default)]
pub struct ValidationHistory {
    entries: Mutex<Vec<ValidationEntry>>,
}

impl ValidationHistory {
    pub fn new() -> Self { Self::default() }
    pub fn entries(&self) -> Vec<ValidationEntry> { self.entries.lock().clone() }
}

impl<M> RoundObserver<M> for ValidationHistory {
    fn on_round_end(&self, report: &RoundReport<'_, M>) {
        if let Some(v) = report.validation {
            self.entries.lock().push(ValidationEntry { round: report.round, metrics: v.clone() });
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentSummary<S, M> {
    pub final_state: S,
    pub rounds_completed: u64,
    pub last_round_metrics: Option<M>,
    pub final_validation: Option<EvalMetrics>,
    pub final_test: Option<EvalMetrics>,
}

pub struct RoundDriver<'a, P: IterativeProcess, D> {
    process: &'a P,
    provider: &'a D,
    sampler: ClientSampler,
    schedule: EvaluationSchedule,
    validation_fn: Option<&'a dyn StateEvaluator<P::State>>,
    test_fn: Option<&'a dyn StateEvaluator<P::State>>,
    observers: Vec<&'a dyn RoundObserver<P::Metrics>>,
}

impl<'a, P, D> RoundDriver<'a, P, D>
where
    P: IterativeProcess,
    D: DatasetProvider<Example = P::Example>,
{
    /// Fails with a configuration error when `clients_per_round` exceeds the
    /// provider's population.
    pub fn new(
        process: &'a P,
        provider: &'a D,
        clients_per_round: usize,
        seed: Option<u64>,
        schedule: EvaluationSchedule,
    ) -> Result<Self> {
        let sampler = ClientSampler::new(provider.client_ids(), clients_per_round, seed)?;
        Ok(Self { process, provider, sampler, schedule, validation_fn: None, test_fn: None, observers: Vec::new() })
    }

    pub fn with_validation(mut self, f: &'a dyn StateEvaluator<P::State>) -> Self {
        self.validation_fn = Some(f);
        self
    }

    pub fn with_test(mut self, f: &'a dyn StateEvaluator<P::State>) -> Self {
        self.test_fn = Some(f);
        self
    }

    pub fn with_observer(mut self, o: &'a dyn RoundObserver<P::Metrics>) -> Self {
        self.observers.push(o);
        self
    }

    pub fn run(&self, num_rounds: u64) -> Result<ExperimentSummary<P::State, P::Metrics>> {
        info!(
            num_rounds,
            clients_per_round = self.sampler.clients_per_round(),
            available_clients = self.sampler.num_available(),
            seed = ?self.sampler.seed(),
            "experiment_start"
        );
        let mut state = self.process.initialize()?;
        let mut last_metrics = None;

        for round in 0..num_rounds {
            let started = Instant::now();
            let client_ids = self.sampler.sample(round);
            let datasets = self.resolve(round, &client_ids)?;
            let (next_state, metrics) = self.process.next(state, &datasets).map_err(|e| {
                warn!(round, error = %e, "round_failed");
                e
            })?;
            state = next_state;
            let elapsed = started.elapsed();
            EXPERIMENT_METRICS.record_round(client_ids.len(), elapsed);

            let validation = match self.validation_fn {
                Some(f) if self.schedule.should_validate(round) => Some(evaluate(f, &state)?),
                _ => None,
            };
            let report = RoundReport {
                round,
                client_ids: &client_ids,
                metrics: &metrics,
                validation: validation.as_ref(),
                elapsed,
                completed_at: chrono::Utc::now().timestamp(),
            };
            for o in &self.observers { o.on_round_end(&report); }
            last_metrics = Some(metrics);
        }

        let final_validation = self.validation_fn.map(|f| evaluate(f, &state)).transpose()?;
        let final_test = self.test_fn.map(|f| evaluate(f, &state)).transpose()?;
        info!(rounds = num_rounds, validation = ?final_validation, test = ?final_test, "experiment_complete");
        Ok(ExperimentSummary {
            final_state: state,
            rounds_completed: num_rounds,
            last_round_metrics: last_metrics,
            final_validation,
            final_test,
        })
    }

    fn resolve<'d>(&'d self, round: u64, client_ids: &'d [ClientId]) -> Result<Vec<ClientDataset<'d, P::Example>>> {
        client_ids
            .iter()
            .map(|id| {
                self.provider
                    .client_data(id)
                    .map(|examples| ClientDataset { client_id: id.as_str(), examples })
                    .ok_or_else(|| FedError::DataResolution { round, client_id: id.clone() })
            })
            .collect()
    }
}

fn evaluate<S>(f: &dyn StateEvaluator<S>, state: &S) -> Result<EvalMetrics> {
    let started = Instant::now();
    let metrics = f.evaluate(state)?;
    EXPERIMENT_METRICS.record_evaluation(f.name(), started.elapsed());
    info!(evaluator = f.name(), metrics = ?metrics, "evaluation_complete");
    Ok(metrics)
}
