//! Weighted merging of client model deltas into one server delta:
//! `Σ wᵢ·δᵢ / Σ wᵢ`, where each task picks how `wᵢ` is derived from the
//! client's locally reported outputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::sampler::ClientId;
use crate::error::{FedError, Result};

pub const NUM_TOKENS_KEY: &str = "num_tokens";

/// What a client reports about its local pass besides the model delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalOutputs {
    pub num_examples: u64,
    /// Additional counters; each is a vector as produced by the local model.
    pub values: BTreeMap<String, Vec<f64>>,
}

impl LocalOutputs {
    pub fn with_value(mut self, key: impl Into<String>, value: Vec<f64>) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Reads a single-element vector as a scalar.
    pub fn squeezed(&self, key: &str) -> Result<f64> {
        match self.values.get(key).map(|v| v.as_slice()) {
            Some([v]) => Ok(*v),
            Some(other) => Err(FedError::InvalidLocalOutput {
                key: key.to_string(),
                reason: format!("expected exactly one element, found {}", other.len()),
            }),
            None => Err(FedError::InvalidLocalOutput { key: key.to_string(), reason: "missing".into() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientWeightPolicy {
    /// Examples processed this round.
    NumExamples,
    /// Non-padding tokens processed this round.
    NumTokens,
}

impl ClientWeightPolicy {
    pub fn weight(&self, outputs: &LocalOutputs) -> Result<f64> {
        match self {
            ClientWeightPolicy::NumExamples => Ok(outputs.num_examples as f64),
            ClientWeightPolicy::NumTokens => outputs.squeezed(NUM_TOKENS_KEY),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientContribution {
    pub client_id: ClientId,
    pub delta: Vec<f32>,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub delta: Vec<f32>,
    pub total_weight: f64,
}

/// Weighted average of client deltas. Zero-weight clients are allowed as long
/// as some other client carries weight.
pub fn weighted_mean(round: u64, contributions: &[ClientContribution]) -> Result<Aggregate> {
    let Some(first) = contributions.first() else {
        return Err(FedError::AggregationDegenerate { round });
    };
    let dim = first.delta.len();
    let mut acc = vec![0f64; dim];
    let mut total_weight = 0f64;
    for c in contributions {
        if !c.weight.is_finite() || c.weight < 0.0 {
            return Err(FedError::InvalidWeight { client_id: c.client_id.clone(), weight: c.weight });
        }
        if c.delta.len() != dim {
            return Err(FedError::ShapeMismatch { expected: dim, actual: c.delta.len() });
        }
        total_weight += c.weight;
        for (a, v) in acc.iter_mut().zip(&c.delta) { *a += *v as f64 * c.weight; }
    }
    if !(total_weight > 0.0 && total_weight.is_finite()) {
        return Err(FedError::AggregationDegenerate { round });
    }
    let delta = acc.into_iter().map(|a| (a / total_weight) as f32).collect();
    Ok(Aggregate { delta, total_weight })
}
