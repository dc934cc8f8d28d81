//! Centralized evaluation of server state on held-out data.
//!
//! The held-out set is split once at setup: the first `K` examples serve as
//! validation during training and the remainder as test. The final test pass
//! runs over validation and test together.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{FedError, Result};
use crate::metrics::{self, BatchOutput, MetricContext, MetricsBuilder};

pub type EvalMetrics = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSplit<E> {
    examples: Vec<E>,
    num_validation: usize,
}

impl<E> EvaluationSplit<E> {
    /// Takes the first `num_validation` examples as validation. A cutoff past
    /// the end leaves the test partition empty.
    pub fn new(held_out: Vec<E>, num_validation: usize) -> Self {
        let num_validation = num_validation.min(held_out.len());
        Self { examples: held_out, num_validation }
    }

    /// Validation and test are both the whole held-out set.
    pub fn same_set(held_out: Vec<E>) -> Self {
        let n = held_out.len();
        Self { examples: held_out, num_validation: n }
    }

    pub fn validation(&self) -> &[E] { &self.examples[..self.num_validation] }
    pub fn test(&self) -> &[E] { &self.examples[self.num_validation..] }
    /// Validation followed by test, i.e. the held-out set in input order.
    pub fn full(&self) -> &[E] { &self.examples }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalTarget {
    Validation,
    ValidationAndTest,
}

/// A concrete model that can score batches of examples.
pub trait EvalModel<E> {
    fn predict(&self, batch: &[E]) -> anyhow::Result<BatchOutput>;
}

/// Anything that turns a server state into a metric map.
pub trait StateEvaluator<S> {
    fn name(&self) -> &str;
    fn evaluate(&self, state: &S) -> Result<EvalMetrics>;
}

type ModelBuilder<M> = Box<dyn Fn() -> M + Send + Sync>;
type AssignWeights<S, M> = Box<dyn Fn(&S, &mut M) -> anyhow::Result<()> + Send + Sync>;

/// Instantiates a fresh model, copies server state into it and runs it over
/// one target of a shared, read-only split.
pub struct Evaluator<S, E, M> {
    name: String,
    split: Arc<EvaluationSplit<E>>,
    target: EvalTarget,
    batch_size: usize,
    model_builder: ModelBuilder<M>,
    assign_weights: AssignWeights<S, M>,
    metrics_builder: MetricsBuilder,
    metric_context: MetricContext,
}

impl<S, E, M: EvalModel<E>> Evaluator<S, E, M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        split: Arc<EvaluationSplit<E>>,
        target: EvalTarget,
        batch_size: usize,
        model_builder: impl Fn() -> M + Send + Sync + 'static,
        assign_weights: impl Fn(&S, &mut M) -> anyhow::Result<()> + Send + Sync + 'static,
        metrics_builder: MetricsBuilder,
        metric_context: MetricContext,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(FedError::out_of_range("eval batch_size", 0, ">= 1"));
        }
        Ok(Self {
            name: name.into(),
            split,
            target,
            batch_size,
            model_builder: Box::new(model_builder),
            assign_weights: Box::new(assign_weights),
            metrics_builder,
            metric_context,
        })
    }

    fn examples(&self) -> &[E] {
        match self.target {
            EvalTarget::Validation => self.split.validation(),
            EvalTarget::ValidationAndTest => self.split.full(),
        }
    }
}

impl<S, E, M: EvalModel<E>> StateEvaluator<S> for Evaluator<S, E, M> {
    fn name(&self) -> &str { &self.name }

    fn evaluate(&self, state: &S) -> Result<EvalMetrics> {
        let mut model = (self.model_builder)();
        (self.assign_weights)(state, &mut model)?;
        let mut set = (self.metrics_builder)(&self.metric_context);
        let examples = self.examples();
        for batch in examples.chunks(self.batch_size) {
            let out = model.predict(batch)?;
            metrics::update_all(&mut set, &out);
        }
        debug!(evaluator = %self.name, examples = examples.len(), "evaluation_pass");
        Ok(metrics::results(&set))
    }
}

/// Decides after which rounds validation runs.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationSchedule {
    rounds_per_eval: u64,
}

impl EvaluationSchedule {
    pub fn new(rounds_per_eval: u64) -> Result<Self> {
        if rounds_per_eval == 0 {
            return Err(FedError::out_of_range("rounds_per_eval", 0, ">= 1"));
        }
        Ok(Self { rounds_per_eval })
    }

    pub fn should_validate(&self, round: u64) -> bool { round % self.rounds_per_eval == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MaskedAccuracy, MetricSet, NumBatchesCounter};

    #[test]
    fn split_partitions_are_disjoint_and_cover_input() {
        let data: Vec<u32> = (0..10).collect();
        let split = EvaluationSplit::new(data.clone(), 4);
        assert_eq!(split.validation().len(), 4);
        assert_eq!(split.test().len(), 6);
        let mut joined = split.validation().to_vec();
        joined.extend_from_slice(split.test());
        assert_eq!(joined, data);
        assert_eq!(split.full(), data.as_slice());
    }

    #[test]
    fn oversized_cutoff_leaves_empty_test() {
        let split = EvaluationSplit::new(vec![1, 2, 3], 10);
        assert_eq!(split.validation(), &[1, 2, 3]);
        assert!(split.test().is_empty());
    }

    #[test]
    fn same_set_validates_on_everything() {
        let split = EvaluationSplit::same_set(vec![1, 2]);
        assert_eq!(split.validation(), split.full());
    }

    #[test]
    fn schedule_cadence() {
        let s = EvaluationSchedule::new(3).unwrap();
        let hits: Vec<u64> = (0..10).filter(|r| s.should_validate(*r)).collect();
        assert_eq!(hits, vec![0, 3, 6, 9]);
        assert!(EvaluationSchedule::new(0).is_err());
    }

    // Predicts a constant token taken from the "server state".
    struct ConstModel { token: u32 }
    impl EvalModel<u32> for ConstModel {
        fn predict(&self, batch: &[u32]) -> anyhow::Result<BatchOutput> {
            Ok(BatchOutput { labels: batch.to_vec(), predictions: vec![self.token; batch.len()], loss: None })
        }
    }

    fn acc_set(_: &MetricContext) -> MetricSet {
        vec![Box::new(MaskedAccuracy::plain("accuracy")), Box::new(NumBatchesCounter::new())]
    }

    fn evaluator(target: EvalTarget) -> Evaluator<u32, u32, ConstModel> {
        let split = Arc::new(EvaluationSplit::new(vec![1, 1, 1, 2, 2, 2, 2], 3));
        Evaluator::new("eval", split, target, 2, || ConstModel { token: 0 }, |s: &u32, m: &mut ConstModel| {
            m.token = *s;
            Ok(())
        }, acc_set, MetricContext::default()).unwrap()
    }

    #[test]
    fn validation_target_sees_only_first_k() {
        let r = evaluator(EvalTarget::Validation).evaluate(&1).unwrap();
        assert_eq!(r["accuracy"], 1.0);
        assert_eq!(r["num_batches"], 2.0);
    }

    #[test]
    fn final_target_concatenates_validation_and_test() {
        let r = evaluator(EvalTarget::ValidationAndTest).evaluate(&1).unwrap();
        assert!((r["accuracy"] - 3.0 / 7.0).abs() < 1e-12);
        assert_eq!(r["num_batches"], 4.0);
    }
}
