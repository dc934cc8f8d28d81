//! Core library for simulated federated-learning experiments.
//!
//! The round loop, client sampling, aggregation weighting and evaluation
//! scheduling live here; models, datasets and the learning algorithm plug in
//! through the traits in [`federated_learning`] and [`evaluation`].

use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

pub mod config;
pub mod error;
pub mod evaluation;
pub mod federated_learning;
pub mod metrics;
pub mod simulation;
pub mod tasks;
mod metrics_ext;

pub use crate::config::{load_config, ExperimentConfig};
pub use error::{FedError, Result};
pub use evaluation::{EvalMetrics, EvalModel, EvalTarget, EvaluationSchedule, EvaluationSplit, Evaluator, StateEvaluator};
pub use federated_learning::{
    ClientDataset, ClientSampler, ClientWeightPolicy, DatasetProvider, ExperimentSummary, FedAvgProcess, FedAvgState,
    IterativeProcess, LoggingObserver, RoundDriver, RoundMetrics, RoundObserver, ValidationHistory,
};
pub use metrics_ext::{ExperimentMetrics, EXPERIMENT_METRICS};
pub use tasks::{SpecialTokens, TaskName, TaskPlan};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber once. `RUST_LOG` drives filtering and
/// `FEDSIM_JSON_LOG=1` switches to JSON lines.
pub fn init_tracing(service: &str) -> anyhow::Result<()> {
    TRACING_INIT.get_or_try_init(|| -> anyhow::Result<()> {
        let json = std::env::var("FEDSIM_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let fmt_layer = if json {
            tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false).boxed()
        } else {
            tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true).boxed()
        };
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        // another subscriber may already be installed (tests, embedding binaries)
        let _ = tracing_subscriber::registry().with(fmt_layer).with(env_filter).try_init();
        Ok(())
    })?;
    info!(target: "fedsim", service, "tracing initialized");
    Ok(())
}
