use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use fedsim_core::federated_learning::{RoundMetrics, ValidationEntry};
use fedsim_core::simulation::{SyntheticTaskData, UnigramModel, UnigramTrainer};
use fedsim_core::{
    EvalMetrics, EvalTarget, EvaluationSchedule, Evaluator, ExperimentConfig, FedAvgProcess, FedAvgState, LoggingObserver,
    RoundDriver, TaskPlan, ValidationHistory,
};

#[derive(Debug, Serialize)]
pub struct ExperimentReport {
    pub experiment_name: String,
    pub task: String,
    pub rounds: u64,
    pub last_round_metrics: Option<RoundMetrics>,
    pub validation_history: Vec<ValidationEntry>,
    pub final_validation: Option<EvalMetrics>,
    pub final_test: Option<EvalMetrics>,
}

/// Builds the task plan, synthetic population, FedAvg process and evaluators
/// from `cfg`, then drives `cfg.total_rounds` rounds.
pub fn run_experiment(cfg: &ExperimentConfig) -> Result<ExperimentReport> {
    let plan = TaskPlan::from_config(cfg).context("invalid experiment configuration")?;
    let data = SyntheticTaskData::generate(&plan, &cfg.simulation);
    info!(task = %plan.task, clients = data.train.num_clients(), held_out = data.held_out.len(), "synthetic_data_ready");

    let trainer = UnigramTrainer::new(&plan, cfg.client_epochs_per_round, cfg.client_batch_size, cfg.client_learning_rate);
    let process = FedAvgProcess::new(trainer, plan.weight_policy, cfg.server_learning_rate);

    let split = Arc::new(plan.eval_split.split(data.held_out));
    let prototype = UnigramModel::for_plan(&plan);
    let evaluator = |name: &str, target: EvalTarget| {
        let proto = prototype.clone();
        Evaluator::new(
            name,
            split.clone(),
            target,
            cfg.client_batch_size,
            move || proto.clone(),
            |state: &FedAvgState, model: &mut UnigramModel| state.assign_weights_to(model),
            plan.metrics_builder,
            plan.metric_context.clone(),
        )
    };
    let validation_fn = evaluator("validation", EvalTarget::Validation)?;
    let test_fn = evaluator("test", EvalTarget::ValidationAndTest)?;

    let history = ValidationHistory::new();
    let summary = RoundDriver::new(
        &process,
        &data.train,
        cfg.clients_per_round,
        cfg.client_datasets_random_seed,
        EvaluationSchedule::new(cfg.rounds_per_eval)?,
    )?
    .with_validation(&validation_fn)
    .with_test(&test_fn)
    .with_observer(&LoggingObserver)
    .with_observer(&history)
    .run(cfg.total_rounds)?;

    Ok(ExperimentReport {
        experiment_name: cfg.experiment_name.clone(),
        task: plan.task.to_string(),
        rounds: summary.rounds_completed,
        last_round_metrics: summary.last_round_metrics,
        validation_history: history.entries(),
        final_validation: summary.final_validation,
        final_test: summary.final_test,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(task: &str) -> ExperimentConfig {
        let mut cfg = ExperimentConfig { task: Some(task.into()), total_rounds: 3, clients_per_round: 3, rounds_per_eval: 2, ..Default::default() };
        cfg.simulation.num_clients = 8;
        cfg.simulation.examples_per_client = 6;
        cfg.simulation.held_out_examples = 24;
        cfg.so_nwp.vocab_size = 40;
        cfg.so_nwp.num_validation_examples = 10;
        cfg.so_lr.num_validation_examples = 10;
        cfg
    }

    #[test]
    fn every_task_runs() {
        for task in fedsim_core::TaskName::names() {
            let report = run_experiment(&small(task)).unwrap();
            assert_eq!(report.rounds, 3);
            assert_eq!(report.validation_history.iter().map(|e| e.round).collect::<Vec<_>>(), vec![0, 2]);
            assert!(report.final_test.is_some(), "{task}");
        }
    }

    #[test]
    fn oversubscribed_rounds_fail_before_training() {
        let mut cfg = small("cifar100");
        cfg.clients_per_round = 9;
        let err = run_experiment(&cfg).unwrap_err();
        assert!(format!("{err:#}").contains("clients_per_round"));
    }

    #[test]
    fn bad_task_is_reported_with_allowed_set() {
        let err = run_experiment(&small("mnist")).unwrap_err();
        assert!(format!("{err:#}").contains("emnist_cr"));
    }
}
