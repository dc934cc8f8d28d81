//! Per-round client subsampling.
//!
//! With a seed, the subset for round `r` depends only on `(seed, r)`, so an
//! experiment can be replayed exactly. Rounds are independent: a client picked
//! in round 3 can be picked again in round 4.

use rand::{rngs::StdRng, seq::index, thread_rng, SeedableRng};

use crate::error::{FedError, Result};

pub type ClientId = String;

// Golden-ratio increment used to spread consecutive round indices.
const ROUND_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone)]
pub struct ClientSampler {
    client_ids: Vec<ClientId>,
    clients_per_round: usize,
    seed: Option<u64>,
}

impl ClientSampler {
    pub fn new(client_ids: Vec<ClientId>, clients_per_round: usize, seed: Option<u64>) -> Result<Self> {
        if clients_per_round == 0 || clients_per_round > client_ids.len() {
            return Err(FedError::out_of_range(
                "clients_per_round",
                clients_per_round,
                format!("1..={} (available clients)", client_ids.len()),
            ));
        }
        Ok(Self { client_ids, clients_per_round, seed })
    }

    pub fn clients_per_round(&self) -> usize { self.clients_per_round }
    pub fn num_available(&self) -> usize { self.client_ids.len() }
    pub fn seed(&self) -> Option<u64> { self.seed }

    /// Draws `clients_per_round` distinct ids for `round`, in draw order.
    pub fn sample(&self, round: u64) -> Vec<ClientId> {
        let picked = match self.seed {
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(round_seed(seed, round));
                index::sample(&mut rng, self.client_ids.len(), self.clients_per_round)
            }
            None => index::sample(&mut thread_rng(), self.client_ids.len(), self.clients_per_round),
        };
        picked.into_iter().map(|i| self.client_ids[i].clone()).collect()
    }
}

/// splitmix64 finalizer over `seed` and the round index.
fn round_seed(seed: u64, round: u64) -> u64 {
    let mut z = seed.wrapping_add(round.wrapping_add(1).wrapping_mul(ROUND_MIX));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
