//! Synthetic backend for running the round loop end to end without real
//! datasets: a skewed, seeded client population and a bias-only ("unigram")
//! softmax model with its local trainer.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::SimulationConfig;
use crate::evaluation::EvalModel;
use crate::federated_learning::{
    ClientDataset, FlatWeights, InMemoryClientData, LocalOutputs, LocalTrainer, LocalUpdate, NUM_TOKENS_KEY,
};
use crate::metrics::{BatchOutput, Token};
use crate::tasks::{LabelShape, TaskPlan};

// Tokens most examples are drawn from; keeps the population learnable.
const HEAD_TOKENS: usize = 20;
const OOV_RATE: f64 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledExample {
    /// One label for classifiers, `sequence_length` labels (padded) otherwise.
    pub labels: Vec<Token>,
}

pub struct SyntheticTaskData {
    pub train: InMemoryClientData<LabeledExample>,
    pub held_out: Vec<LabeledExample>,
}

struct Generator<'a> {
    plan: &'a TaskPlan,
    rng: StdRng,
}

impl<'a> Generator<'a> {
    /// First and last ordinary label id.
    fn content_range(&self) -> (Token, Token) {
        match &self.plan.special_tokens {
            Some(s) => (1, s.oov.first().copied().unwrap_or(s.bos).saturating_sub(1).max(1)),
            None => (0, self.plan.label_space.saturating_sub(1) as Token),
        }
    }

    fn draw_token(&mut self, favorite: Token) -> Token {
        let (lo, hi) = self.content_range();
        if let Some(s) = &self.plan.special_tokens {
            if !s.oov.is_empty() && self.rng.gen_bool(OOV_RATE) {
                return s.oov[self.rng.gen_range(0..s.oov.len())];
            }
        }
        if self.rng.gen_bool(0.5) {
            return favorite;
        }
        let head_hi = hi.min(lo + HEAD_TOKENS as Token - 1);
        self.rng.gen_range(lo..=head_hi)
    }

    fn example(&mut self, favorite: Token) -> LabeledExample {
        match self.plan.label_shape {
            LabelShape::Single => LabeledExample { labels: vec![self.draw_token(favorite)] },
            LabelShape::Sequence { length } => {
                let (pad, eos) = match &self.plan.special_tokens {
                    Some(s) => (s.pad, Some(s.eos)),
                    None => (0, None),
                };
                let used = self.rng.gen_range(1..=length);
                let mut labels: Vec<Token> = (0..used).map(|_| self.draw_token(favorite)).collect();
                if used < length {
                    labels.extend(eos);
                }
                labels.resize(length, pad);
                LabeledExample { labels }
            }
        }
    }

    fn favorite(&mut self) -> Token {
        let (lo, hi) = self.content_range();
        self.rng.gen_range(lo..=hi.min(lo + HEAD_TOKENS as Token - 1))
    }
}

impl SyntheticTaskData {
    pub fn generate(plan: &TaskPlan, sim: &SimulationConfig) -> Self {
        let mut g = Generator { plan, rng: StdRng::seed_from_u64(sim.seed) };
        let per_client = plan.max_elements_per_user.map_or(sim.examples_per_client, |cap| sim.examples_per_client.min(cap));
        let clients: Vec<(String, Vec<LabeledExample>)> = (0..sim.num_clients)
            .map(|i| {
                let fav = g.favorite();
                // uneven client sizes, at least one example each
                let n = g.rng.gen_range(1..=per_client.max(1));
                (format!("client_{i:04}"), (0..n).map(|_| g.example(fav)).collect())
            })
            .collect();
        let held_out = (0..sim.held_out_examples)
            .map(|_| {
                let fav = g.favorite();
                g.example(fav)
            })
            .collect();
        Self { train: InMemoryClientData::new(clients), held_out }
    }
}

fn log_softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let lse = logits.iter().map(|l| (*l as f64 - max).exp()).sum::<f64>().ln() + max;
    logits.iter().map(|l| *l as f64 - lse).collect()
}

/// Predicts the same arg-max token at every position.
#[derive(Debug, Clone)]
pub struct UnigramModel {
    logits: Vec<f32>,
    pad: Option<Token>,
}

impl UnigramModel {
    pub fn new(label_space: usize, pad: Option<Token>) -> Self { Self { logits: vec![0.0; label_space], pad } }

    pub fn for_plan(plan: &TaskPlan) -> Self {
        Self::new(plan.label_space, plan.special_tokens.as_ref().map(|s| s.pad))
    }

    fn argmax(&self) -> Token {
        self.logits
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i as Token) != self.pad)
            .fold((0usize, f32::NEG_INFINITY), |best, (i, l)| if *l > best.1 { (i, *l) } else { best })
            .0 as Token
    }
}

impl FlatWeights for UnigramModel {
    fn set_weights(&mut self, weights: &[f32]) -> anyhow::Result<()> {
        anyhow::ensure!(weights.len() == self.logits.len(), "expected {} weights, got {}", self.logits.len(), weights.len());
        self.logits.copy_from_slice(weights);
        Ok(())
    }
}

impl EvalModel<LabeledExample> for UnigramModel {
    fn predict(&self, batch: &[LabeledExample]) -> anyhow::Result<BatchOutput> {
        let log_probs = log_softmax(&self.logits);
        let best = self.argmax();
        let mut out = BatchOutput::default();
        let (mut nll, mut counted) = (0f64, 0usize);
        for ex in batch {
            for label in &ex.labels {
                let lp = log_probs
                    .get(*label as usize)
                    .ok_or_else(|| anyhow::anyhow!("label {label} outside label space {}", log_probs.len()))?;
                out.labels.push(*label);
                out.predictions.push(best);
                if Some(*label) != self.pad {
                    nll -= lp;
                    counted += 1;
                }
            }
        }
        out.loss = (counted > 0).then(|| nll / counted as f64);
        Ok(out)
    }
}

/// Gradient steps on the softmax cross-entropy of a bias-only model.
#[derive(Debug, Clone)]
pub struct UnigramTrainer {
    label_space: usize,
    pad: Option<Token>,
    epochs: usize,
    batch_size: usize,
    learning_rate: f32,
}

impl UnigramTrainer {
    pub fn new(plan: &TaskPlan, epochs: usize, batch_size: usize, learning_rate: f32) -> Self {
        Self { label_space: plan.label_space, pad: plan.special_tokens.as_ref().map(|s| s.pad), epochs, batch_size, learning_rate }
    }
}

impl LocalTrainer for UnigramTrainer {
    type Example = LabeledExample;

    fn initial_weights(&self) -> Vec<f32> { vec![0.0; self.label_space] }

    fn train(&self, weights: &[f32], client: &ClientDataset<'_, LabeledExample>) -> anyhow::Result<LocalUpdate> {
        let mut w = weights.to_vec();
        let (mut examples, mut tokens, mut batches, mut loss_sum) = (0u64, 0u64, 0u64, 0f64);
        for _ in 0..self.epochs {
            for batch in client.batches(self.batch_size) {
                let mut counts = vec![0f32; self.label_space];
                let mut n = 0u64;
                for label in batch.iter().flat_map(|e| e.labels.iter()).filter(|t| Some(**t) != self.pad) {
                    let slot = counts
                        .get_mut(*label as usize)
                        .ok_or_else(|| anyhow::anyhow!("client {}: label {label} outside label space", client.client_id))?;
                    *slot += 1.0;
                    n += 1;
                }
                examples += batch.len() as u64;
                batches += 1;
                if n == 0 { continue; }
                tokens += n;
                let log_probs = log_softmax(&w);
                loss_sum -= counts.iter().zip(&log_probs).map(|(c, lp)| *c as f64 * lp).sum::<f64>() / n as f64;
                for ((wi, c), lp) in w.iter_mut().zip(&counts).zip(&log_probs) {
                    let grad = lp.exp() as f32 - c / n as f32;
                    *wi -= self.learning_rate * grad;
                }
            }
        }
        let delta = w.iter().zip(weights).map(|(a, b)| a - b).collect();
        Ok(LocalUpdate {
            delta,
            outputs: LocalOutputs { num_examples: examples, ..Default::default() }.with_value(NUM_TOKENS_KEY, vec![tokens as f64]),
            loss: if batches == 0 { 0.0 } else { loss_sum / batches as f64 },
        })
    }
}
