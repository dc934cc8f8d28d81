//! Generalized FedAvg over a flat parameter vector.
//!
//! Local training is delegated to a [`LocalTrainer`]; this process only runs
//! it for each sampled client, weights the returned deltas and applies the
//! weighted mean with a server learning rate.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::aggregation::{weighted_mean, ClientContribution, ClientWeightPolicy, LocalOutputs, NUM_TOKENS_KEY};
use super::process::{ClientDataset, IterativeProcess, RoundMetrics};
use crate::error::{FedError, Result};

/// Output of one client's local pass.
#[derive(Debug, Clone)]
pub struct LocalUpdate {
    pub delta: Vec<f32>,
    pub outputs: LocalOutputs,
    pub loss: f64,
}

pub trait LocalTrainer: Sync {
    type Example: Sync;

    fn initial_weights(&self) -> Vec<f32>;
    fn train(&self, weights: &[f32], client: &ClientDataset<'_, Self::Example>) -> anyhow::Result<LocalUpdate>;
}

/// Models that accept a flat parameter vector.
pub trait FlatWeights {
    fn set_weights(&mut self, weights: &[f32]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FedAvgState {
    pub model_weights: Vec<f32>,
    /// Rounds applied so far.
    pub round_num: u64,
}

impl FedAvgState {
    pub fn assign_weights_to<M: FlatWeights>(&self, model: &mut M) -> anyhow::Result<()> {
        model.set_weights(&self.model_weights)
    }
}

pub struct FedAvgProcess<T> {
    trainer: T,
    weight_policy: ClientWeightPolicy,
    server_learning_rate: f32,
}

impl<T: LocalTrainer> FedAvgProcess<T> {
    pub fn new(trainer: T, weight_policy: ClientWeightPolicy, server_learning_rate: f32) -> Self {
        Self { trainer, weight_policy, server_learning_rate }
    }

}

impl<T: LocalTrainer> IterativeProcess for FedAvgProcess<T> {
    type State = FedAvgState;
    type Example = T::Example;
    type Metrics = RoundMetrics;

    fn initialize(&self) -> Result<FedAvgState> {
        Ok(FedAvgState { model_weights: self.trainer.initial_weights(), round_num: 0 })
    }

    fn next(&self, state: FedAvgState, clients: &[ClientDataset<'_, T::Example>]) -> Result<(FedAvgState, RoundMetrics)> {
        // collect keeps sampled order, so the sum below matches a sequential run
        let updates: Vec<LocalUpdate> = clients
            .par_iter()
            .map(|c| self.trainer.train(&state.model_weights, c))
            .collect::<anyhow::Result<_>>()?;

        let mut contributions = Vec::with_capacity(updates.len());
        let mut num_examples = 0u64;
        let mut num_tokens = 0f64;
        let mut loss_sum = 0f64;
        for (client, update) in clients.iter().zip(&updates) {
            let weight = self.weight_policy.weight(&update.outputs)?;
            num_examples += update.outputs.num_examples;
            // absent counter reads as zero; a malformed one is an error
            if update.outputs.values.contains_key(NUM_TOKENS_KEY) {
                num_tokens += update.outputs.squeezed(NUM_TOKENS_KEY)?;
            }
            loss_sum += update.loss;
            debug!(round = state.round_num, client = client.client_id, weight, "client_update");
            contributions.push(ClientContribution { client_id: client.client_id.to_string(), delta: update.delta.clone(), weight });
        }
        let agg = weighted_mean(state.round_num, &contributions)?;
        if agg.delta.len() != state.model_weights.len() {
            return Err(FedError::ShapeMismatch { expected: state.model_weights.len(), actual: agg.delta.len() });
        }

        let model_weights = state
            .model_weights
            .iter()
            .zip(&agg.delta)
            .map(|(w, d)| w + self.server_learning_rate * d)
            .collect();

        let mut metrics = RoundMetrics::new();
        metrics.insert("num_clients", clients.len() as f64);
        metrics.insert("total_weight", agg.total_weight);
        metrics.insert("num_examples", num_examples as f64);
        metrics.insert("num_tokens", num_tokens);
        metrics.insert("mean_client_loss", if clients.is_empty() { 0.0 } else { loss_sum / clients.len() as f64 });

        Ok((FedAvgState { model_weights, round_num: state.round_num + 1 }, metrics))
    }
}
