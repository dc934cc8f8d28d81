//! Contracts between the round driver and its collaborators: the dataset
//! provider that owns client data and the iterative process that owns the
//! learning algorithm.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::sampler::ClientId;
use crate::error::Result;

/// One client's examples, borrowed from the provider for a single round.
#[derive(Debug, Clone, Copy)]
pub struct ClientDataset<'a, E> {
    pub client_id: &'a str,
    pub examples: &'a [E],
}

impl<'a, E> ClientDataset<'a, E> {
    pub fn len(&self) -> usize { self.examples.len() }
    pub fn is_empty(&self) -> bool { self.examples.is_empty() }

    /// Splits the examples into consecutive batches; the last may be short.
    pub fn batches(&self, batch_size: usize) -> std::slice::Chunks<'a, E> {
        self.examples.chunks(batch_size.max(1))
    }
}

pub trait DatasetProvider {
    type Example;

    /// Every client id known to the experiment, in a stable order.
    fn client_ids(&self) -> Vec<ClientId>;
    /// `None` when the id is not part of this source.
    fn client_data(&self, client_id: &str) -> Option<&[Self::Example]>;
    /// All examples of all clients, concatenated in `client_ids` order.
    fn all_clients(&self) -> Vec<Self::Example>
    where
        Self::Example: Clone,
    {
        self.client_ids()
            .iter()
            .filter_map(|id| self.client_data(id))
            .flat_map(|examples| examples.iter().cloned())
            .collect()
    }
}

/// Fixed, in-memory client population.
#[derive(Debug, Clone)]
pub struct InMemoryClientData<E> {
    clients: BTreeMap<ClientId, Vec<E>>,
}

impl<E> InMemoryClientData<E> {
    pub fn new(clients: impl IntoIterator<Item = (ClientId, Vec<E>)>) -> Self {
        Self { clients: clients.into_iter().collect() }
    }

    pub fn num_clients(&self) -> usize { self.clients.len() }
}

impl<E> DatasetProvider for InMemoryClientData<E> {
    type Example = E;

    fn client_ids(&self) -> Vec<ClientId> { self.clients.keys().cloned().collect() }

    fn client_data(&self, client_id: &str) -> Option<&[E]> {
        self.clients.get(client_id).map(|v| v.as_slice())
    }
}

/// Named scalars reported once per round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundMetrics(pub BTreeMap<String, f64>);

impl RoundMetrics {
    pub fn new() -> Self { Self::default() }
    pub fn insert(&mut self, name: impl Into<String>, value: f64) { self.0.insert(name.into(), value); }
    pub fn get(&self, name: &str) -> Option<f64> { self.0.get(name).copied() }
    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> { self.0.iter() }
}

impl FromIterator<(String, f64)> for RoundMetrics {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self { Self(iter.into_iter().collect()) }
}

/// The federated computation driven round by round.
///
/// `initialize` is called once per experiment. `next` consumes the current
/// state and returns its successor; the driver never looks inside either.
pub trait IterativeProcess {
    type State: Clone;
    type Example;
    type Metrics: std::fmt::Debug + Clone;

    fn initialize(&self) -> Result<Self::State>;

    fn next(
        &self,
        state: Self::State,
        clients: &[ClientDataset<'_, Self::Example>],
    ) -> Result<(Self::State, Self::Metrics)>;
}
