//! Task catalogue: maps each task name to the pieces the shared round loop
//! needs (client weighting, evaluation split, metric set, label space).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ExperimentConfig;
use crate::error::{FedError, Result};
use crate::evaluation::EvaluationSplit;
use crate::federated_learning::ClientWeightPolicy;
use crate::metrics::{
    MaskedAccuracy, MeanLoss, MetricContext, MetricSet, MetricsBuilder, NumBatchesCounter, NumTokensCounter, Token,
};

pub const EMNIST_MODELS: [&str; 2] = ["cnn", "2nn"];

const CIFAR100_CLASSES: usize = 100;
const EMNIST_CLASSES: usize = 62;
const EMNIST_PIXELS: usize = 28 * 28;
const SHAKESPEARE_CHARS: usize = 86;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    Cifar100,
    EmnistCr,
    EmnistAe,
    Shakespeare,
    StackoverflowNwp,
    StackoverflowLr,
}

impl TaskName {
    pub const ALL: [TaskName; 6] = [
        TaskName::Cifar100,
        TaskName::EmnistCr,
        TaskName::EmnistAe,
        TaskName::Shakespeare,
        TaskName::StackoverflowNwp,
        TaskName::StackoverflowLr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::Cifar100 => "cifar100",
            TaskName::EmnistCr => "emnist_cr",
            TaskName::EmnistAe => "emnist_ae",
            TaskName::Shakespeare => "shakespeare",
            TaskName::StackoverflowNwp => "stackoverflow_nwp",
            TaskName::StackoverflowLr => "stackoverflow_lr",
        }
    }

    pub fn names() -> Vec<&'static str> { Self::ALL.iter().map(|t| t.as_str()).collect() }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for TaskName {
    type Err = FedError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| FedError::invalid_choice("task", s, &Self::names()))
    }
}

/// Reserved ids of a token vocabulary of `vocab_size` words followed by
/// `num_oov_buckets` overflow buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad: Token,
    pub oov: Vec<Token>,
    pub bos: Token,
    pub eos: Token,
}

impl SpecialTokens {
    /// Fails when the largest id, `vocab_size + num_oov_buckets + 2`, does not
    /// fit in a [`Token`].
    pub fn new(vocab_size: usize, num_oov_buckets: usize) -> Result<Self> {
        let eos = vocab_size
            .checked_add(num_oov_buckets)
            .and_then(|n| n.checked_add(2))
            .and_then(|n| Token::try_from(n).ok())
            .ok_or_else(|| {
                FedError::out_of_range(
                    "so_nwp.vocab_size",
                    format!("{vocab_size} (+{num_oov_buckets} oov buckets)"),
                    format!("vocab_size + num_oov_buckets + 2 <= {}", Token::MAX),
                )
            })?;
        let v = vocab_size as Token;
        let b = num_oov_buckets as Token;
        Ok(Self { pad: 0, oov: (0..b).map(|n| v + 1 + n).collect(), bos: v + b + 1, eos })
    }

    /// Size of the output space, specials included.
    pub fn vocab_with_specials(&self) -> usize { self.eos as usize + 1 }

    pub fn metric_context(&self) -> MetricContext {
        MetricContext { pad: Some(self.pad), oov: self.oov.clone(), eos: Some(self.eos) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalSplitPolicy {
    /// Validation and final test both cover the whole held-out set.
    SameSet,
    /// First `num_validation_examples` validate; the final test covers all.
    Holdout { num_validation_examples: usize },
}

impl EvalSplitPolicy {
    pub fn split<E>(&self, held_out: Vec<E>) -> EvaluationSplit<E> {
        match self {
            EvalSplitPolicy::SameSet => EvaluationSplit::same_set(held_out),
            EvalSplitPolicy::Holdout { num_validation_examples } => EvaluationSplit::new(held_out, *num_validation_examples),
        }
    }
}

/// Whether a task predicts one label per example or one per sequence step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelShape {
    Single,
    Sequence { length: usize },
}

#[derive(Debug)]
pub struct TaskPlan {
    pub task: TaskName,
    pub weight_policy: ClientWeightPolicy,
    pub eval_split: EvalSplitPolicy,
    pub metrics_builder: MetricsBuilder,
    pub metric_context: MetricContext,
    pub special_tokens: Option<SpecialTokens>,
    /// Number of distinct labels the model can emit.
    pub label_space: usize,
    pub label_shape: LabelShape,
    /// Cap on training examples per client, when the task has one.
    pub max_elements_per_user: Option<usize>,
    pub model_summary: String,
}

impl TaskPlan {
    pub fn from_config(cfg: &ExperimentConfig) -> Result<Self> {
        let task = cfg.validate()?;
        let plan = match task {
            TaskName::Cifar100 => Self::classifier(
                task,
                CIFAR100_CLASSES,
                format!("resnet18 over {0}x{0}x3 crops, {CIFAR100_CLASSES} classes", cfg.cifar100.crop_size),
            ),
            TaskName::EmnistCr => {
                let arch = if cfg.emnist_cr.model == "cnn" { "conv + dropout" } else { "two hidden dense layers" };
                Self::classifier(task, EMNIST_CLASSES, format!("{arch} ({}), {EMNIST_CLASSES} classes", cfg.emnist_cr.model))
            }
            TaskName::EmnistAe => Self {
                metrics_builder: autoencoder_metrics,
                label_space: EMNIST_PIXELS,
                model_summary: format!("dense autoencoder over {EMNIST_PIXELS} pixels"),
                ..Self::classifier(task, EMNIST_PIXELS, String::new())
            },
            TaskName::Shakespeare => {
                let specials = SpecialTokens::new(SHAKESPEARE_CHARS, 1)?;
                Self {
                    task,
                    weight_policy: ClientWeightPolicy::NumExamples,
                    eval_split: EvalSplitPolicy::SameSet,
                    metrics_builder: char_metrics,
                    metric_context: specials.metric_context(),
                    label_space: specials.vocab_with_specials(),
                    label_shape: LabelShape::Sequence { length: cfg.shakespeare.sequence_length },
                    special_tokens: Some(specials),
                    max_elements_per_user: None,
                    model_summary: format!("character GRU, sequence length {}", cfg.shakespeare.sequence_length),
                }
            }
            TaskName::StackoverflowNwp => {
                let nwp = &cfg.so_nwp;
                let specials = SpecialTokens::new(nwp.vocab_size, nwp.num_oov_buckets)?;
                Self {
                    task,
                    weight_policy: ClientWeightPolicy::NumTokens,
                    eval_split: EvalSplitPolicy::Holdout { num_validation_examples: nwp.num_validation_examples },
                    metrics_builder: next_word_metrics,
                    metric_context: specials.metric_context(),
                    label_space: specials.vocab_with_specials(),
                    label_shape: LabelShape::Sequence { length: nwp.sequence_length },
                    special_tokens: Some(specials),
                    max_elements_per_user: Some(nwp.max_elements_per_user),
                    model_summary: format!(
                        "recurrent model: vocab {} + {} oov, embedding {}, latent {}, {} layer(s), shared_embedding={}",
                        nwp.vocab_size, nwp.num_oov_buckets, nwp.embedding_size, nwp.latent_size, nwp.num_layers, nwp.shared_embedding
                    ),
                }
            }
            TaskName::StackoverflowLr => Self {
                eval_split: EvalSplitPolicy::Holdout { num_validation_examples: cfg.so_lr.num_validation_examples },
                max_elements_per_user: Some(cfg.so_lr.max_elements_per_user),
                ..Self::classifier(
                    task,
                    cfg.so_lr.vocab_tags_size,
                    format!("logistic regression: {} tokens -> {} tags", cfg.so_lr.vocab_tokens_size, cfg.so_lr.vocab_tags_size),
                )
            },
        };
        info!(task = %plan.task, weight_policy = ?plan.weight_policy, split = ?plan.eval_split, model = %plan.model_summary, "task_plan");
        Ok(plan)
    }

    fn classifier(task: TaskName, classes: usize, model_summary: String) -> Self {
        Self {
            task,
            weight_policy: ClientWeightPolicy::NumExamples,
            eval_split: EvalSplitPolicy::SameSet,
            metrics_builder: classification_metrics,
            metric_context: MetricContext::default(),
            special_tokens: None,
            label_space: classes,
            label_shape: LabelShape::Single,
            max_elements_per_user: None,
            model_summary,
        }
    }
}

fn classification_metrics(_: &MetricContext) -> MetricSet {
    vec![Box::new(MaskedAccuracy::plain("accuracy")), Box::new(NumBatchesCounter::new()), Box::new(MeanLoss::new())]
}

fn autoencoder_metrics(_: &MetricContext) -> MetricSet {
    vec![Box::new(MeanLoss::new()), Box::new(NumBatchesCounter::new())]
}

fn char_metrics(ctx: &MetricContext) -> MetricSet {
    let pad = ctx.pad.unwrap_or(0);
    vec![
        Box::new(MaskedAccuracy::new("accuracy", [pad])),
        Box::new(NumBatchesCounter::new()),
        Box::new(NumTokensCounter::new([pad])),
        Box::new(MeanLoss::new()),
    ]
}

fn next_word_metrics(ctx: &MetricContext) -> MetricSet {
    let pad = ctx.pad.unwrap_or(0);
    let with_oov = [pad];
    let no_oov: Vec<Token> = std::iter::once(pad).chain(ctx.oov.iter().copied()).collect();
    // bos never appears as a label
    let no_oov_or_eos: Vec<Token> = [pad].into_iter().chain(ctx.eos).chain(ctx.oov.iter().copied()).collect();
    vec![
        Box::new(MaskedAccuracy::new("accuracy_with_oov", with_oov)),
        Box::new(MaskedAccuracy::new("accuracy_no_oov", no_oov)),
        Box::new(MaskedAccuracy::new("accuracy_no_oov_or_eos", no_oov_or_eos)),
        Box::new(NumBatchesCounter::new()),
        Box::new(NumTokensCounter::new([pad])),
        Box::new(MeanLoss::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{results, update_all, BatchOutput};

    fn cfg(task: &str) -> ExperimentConfig { ExperimentConfig { task: Some(task.into()), ..Default::default() } }

    #[test]
    fn task_names_round_trip() {
        for t in TaskName::ALL { assert_eq!(t.as_str().parse::<TaskName>().unwrap(), t); }
        assert!("imagenet".parse::<TaskName>().is_err());
    }

    #[test]
    fn special_token_layout() {
        let s = SpecialTokens::new(10000, 1).unwrap();
        assert_eq!(s.pad, 0);
        assert_eq!(s.oov, vec![10001]);
        assert_eq!(s.bos, 10002);
        assert_eq!(s.eos, 10003);
        let s = SpecialTokens::new(10, 3).unwrap();
        assert_eq!(s.oov, vec![11, 12, 13]);
        assert_eq!(s.eos, 15);
        assert_eq!(s.vocab_with_specials(), 16);
    }

    #[test]
    fn vocabulary_past_token_range_is_rejected() {
        let max = Token::MAX as usize;
        assert_eq!(SpecialTokens::new(max - 3, 1).unwrap().eos, Token::MAX);
        assert!(SpecialTokens::new(max - 2, 1).is_err());
        let mut c = cfg("stackoverflow_nwp");
        c.so_nwp.vocab_size = 1 << 32;
        let err = TaskPlan::from_config(&c).unwrap_err();
        assert!(matches!(err, FedError::Configuration { field: "so_nwp.vocab_size", .. }));
    }

    #[test]
    fn nwp_weights_by_tokens_and_holds_out_validation() {
        let plan = TaskPlan::from_config(&cfg("stackoverflow_nwp")).unwrap();
        assert_eq!(plan.weight_policy, ClientWeightPolicy::NumTokens);
        assert_eq!(plan.eval_split, EvalSplitPolicy::Holdout { num_validation_examples: 10000 });
        assert_eq!(plan.label_shape, LabelShape::Sequence { length: 20 });
    }

    #[test]
    fn classification_tasks_weight_by_examples() {
        for t in ["cifar100", "emnist_cr", "emnist_ae", "shakespeare", "stackoverflow_lr"] {
            let plan = TaskPlan::from_config(&cfg(t)).unwrap();
            assert_eq!(plan.weight_policy, ClientWeightPolicy::NumExamples, "{t}");
        }
    }

    #[test]
    fn nwp_metric_set_masks_specials() {
        let plan = TaskPlan::from_config(&cfg("stackoverflow_nwp")).unwrap();
        let s = plan.special_tokens.clone().unwrap();
        let mut set = (plan.metrics_builder)(&plan.metric_context);
        let labels = vec![s.pad, 3, s.oov[0], s.eos];
        update_all(&mut set, &BatchOutput { predictions: labels.clone(), labels, loss: Some(0.5) });
        let r = results(&set);
        assert_eq!(r["accuracy_with_oov"], 1.0);
        assert_eq!(r["accuracy_no_oov"], 1.0);
        assert_eq!(r["accuracy_no_oov_or_eos"], 1.0);
        assert_eq!(r["num_tokens"], 3.0);
        assert_eq!(r["num_batches"], 1.0);
        assert_eq!(r["loss"], 0.5);
    }

    #[test]
    fn holdout_split_uses_cutoff() {
        let split = EvalSplitPolicy::Holdout { num_validation_examples: 2 }.split(vec![1, 2, 3, 4, 5]);
        assert_eq!(split.validation(), &[1, 2]);
        assert_eq!(split.test(), &[3, 4, 5]);
    }
}
