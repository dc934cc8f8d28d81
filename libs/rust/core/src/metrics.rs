//! Evaluation metrics accumulated over batches of model outputs.
//!
//! Masked accuracy drops every position whose ground-truth token is in the
//! mask from both numerator and denominator.

use std::collections::{BTreeMap, HashSet};

pub type Token = u32;

/// Flattened model output for one batch: one label and one prediction per
/// position (a position is a sequence step or, for classifiers, an example).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutput {
    pub labels: Vec<Token>,
    pub predictions: Vec<Token>,
    /// Mean loss over the batch, when the model computes one.
    pub loss: Option<f64>,
}

pub trait Metric: Send {
    fn name(&self) -> &str;
    fn update(&mut self, batch: &BatchOutput);
    fn result(&self) -> f64;
}

pub type MetricSet = Vec<Box<dyn Metric>>;

/// Builds a fresh metric set; evaluations never share accumulators.
pub type MetricsBuilder = fn(&MetricContext) -> MetricSet;

/// Values metric builders may need to configure their masks.
#[derive(Debug, Clone, Default)]
pub struct MetricContext {
    pub pad: Option<Token>,
    pub oov: Vec<Token>,
    pub eos: Option<Token>,
}

pub struct MaskedAccuracy {
    name: String,
    masked: HashSet<Token>,
    correct: u64,
    total: u64,
}

impl MaskedAccuracy {
    pub fn new(name: impl Into<String>, masked: impl IntoIterator<Item = Token>) -> Self {
        Self { name: name.into(), masked: masked.into_iter().collect(), correct: 0, total: 0 }
    }

    /// Unmasked accuracy.
    pub fn plain(name: impl Into<String>) -> Self { Self::new(name, []) }

    pub fn counted(&self) -> u64 { self.total }
}

impl Metric for MaskedAccuracy {
    fn name(&self) -> &str { &self.name }

    fn update(&mut self, batch: &BatchOutput) {
        for (label, pred) in batch.labels.iter().zip(&batch.predictions) {
            if self.masked.contains(label) { continue; }
            self.total += 1;
            if label == pred { self.correct += 1; }
        }
    }

    fn result(&self) -> f64 {
        if self.total == 0 { 0.0 } else { self.correct as f64 / self.total as f64 }
    }
}

#[derive(Default)]
pub struct NumBatchesCounter { batches: u64 }

impl NumBatchesCounter {
    pub fn new() -> Self { Self::default() }
}

impl Metric for NumBatchesCounter {
    fn name(&self) -> &str { "num_batches" }
    fn update(&mut self, _batch: &BatchOutput) { self.batches += 1; }
    fn result(&self) -> f64 { self.batches as f64 }
}

/// Counts label tokens outside the mask (normally just padding).
pub struct NumTokensCounter {
    masked: HashSet<Token>,
    tokens: u64,
}

impl NumTokensCounter {
    pub fn new(masked: impl IntoIterator<Item = Token>) -> Self {
        Self { masked: masked.into_iter().collect(), tokens: 0 }
    }
}

impl Metric for NumTokensCounter {
    fn name(&self) -> &str { "num_tokens" }
    fn update(&mut self, batch: &BatchOutput) {
        self.tokens += batch.labels.iter().filter(|t| !self.masked.contains(t)).count() as u64;
    }
    fn result(&self) -> f64 { self.tokens as f64 }
}

#[derive(Default)]
pub struct MeanLoss { sum: f64, batches: u64 }

impl MeanLoss {
    pub fn new() -> Self { Self::default() }
}

impl Metric for MeanLoss {
    fn name(&self) -> &str { "loss" }
    fn update(&mut self, batch: &BatchOutput) {
        if let Some(l) = batch.loss { self.sum += l; self.batches += 1; }
    }
    fn result(&self) -> f64 {
        if self.batches == 0 { 0.0 } else { self.sum / self.batches as f64 }
    }
}

pub fn update_all(metrics: &mut MetricSet, batch: &BatchOutput) {
    for m in metrics.iter_mut() { m.update(batch); }
}

pub fn results(metrics: &MetricSet) -> BTreeMap<String, f64> {
    metrics.iter().map(|m| (m.name().to_string(), m.result())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAD: Token = 0;
    const OOV: Token = 11;
    const EOS: Token = 13;

    fn nwp_set() -> MetricSet {
        vec![
            Box::new(MaskedAccuracy::new("accuracy_with_oov", [PAD])),
            Box::new(MaskedAccuracy::new("accuracy_no_oov", [PAD, OOV])),
            Box::new(MaskedAccuracy::new("accuracy_no_oov_or_eos", [PAD, EOS, OOV])),
            Box::new(NumBatchesCounter::new()),
            Box::new(NumTokensCounter::new([PAD])),
        ]
    }

    #[test]
    fn exclusion_sets_narrow_denominator() {
        let batch = BatchOutput { labels: vec![PAD, 3, OOV, EOS], predictions: vec![5, 3, OOV, EOS], loss: None };
        let mut with_oov = MaskedAccuracy::new("a", [PAD]);
        let mut no_oov = MaskedAccuracy::new("b", [PAD, OOV]);
        let mut no_oov_eos = MaskedAccuracy::new("c", [PAD, EOS, OOV]);
        for m in [&mut with_oov, &mut no_oov, &mut no_oov_eos] { m.update(&batch); }
        assert_eq!(with_oov.result(), 1.0);
        assert_eq!(with_oov.counted(), 3);
        assert_eq!(no_oov.counted(), 2);
        assert_eq!(no_oov_eos.counted(), 1);
    }

    #[test]
    fn accuracy_ordering_when_oov_and_eos_are_right() {
        // wrong only on an ordinary token; excluded positions are all correct
        let batch = BatchOutput { labels: vec![PAD, 3, 4, OOV, EOS], predictions: vec![PAD, 3, 7, OOV, EOS], loss: None };
        let mut set = nwp_set();
        update_all(&mut set, &batch);
        let r = results(&set);
        assert!(r["accuracy_with_oov"] >= r["accuracy_no_oov"]);
        assert!(r["accuracy_no_oov"] >= r["accuracy_no_oov_or_eos"]);
        assert_eq!(r["accuracy_no_oov_or_eos"], 0.5);
    }

    #[test]
    fn counters_track_batches_and_non_pad_tokens() {
        let mut set = nwp_set();
        update_all(&mut set, &BatchOutput { labels: vec![1, 2, PAD, PAD], predictions: vec![0; 4], loss: None });
        update_all(&mut set, &BatchOutput { labels: vec![3, PAD], predictions: vec![0; 2], loss: None });
        let r = results(&set);
        assert_eq!(r["num_batches"], 2.0);
        assert_eq!(r["num_tokens"], 3.0);
    }

    #[test]
    fn empty_denominator_is_zero() {
        let mut acc = MaskedAccuracy::new("acc", [PAD]);
        acc.update(&BatchOutput { labels: vec![PAD, PAD], predictions: vec![PAD, PAD], loss: None });
        assert_eq!(acc.result(), 0.0);
    }

    #[test]
    fn mean_loss_ignores_batches_without_loss() {
        let mut loss = MeanLoss::new();
        loss.update(&BatchOutput { loss: Some(2.0), ..Default::default() });
        loss.update(&BatchOutput { loss: None, ..Default::default() });
        loss.update(&BatchOutput { loss: Some(4.0), ..Default::default() });
        assert_eq!(loss.result(), 3.0);
    }
}
