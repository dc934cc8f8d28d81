//! Federated round orchestration: client sampling, the iterative-process
//! contract, weighted aggregation and the round driver.

pub mod aggregation;
pub mod driver;
pub mod fedavg;
pub mod process;
pub mod sampler;

pub use aggregation::{weighted_mean, Aggregate, ClientContribution, ClientWeightPolicy, LocalOutputs, NUM_TOKENS_KEY};
pub use driver::{ExperimentSummary, LoggingObserver, RoundDriver, RoundObserver, RoundReport, ValidationEntry, ValidationHistory};
pub use fedavg::{FedAvgProcess, FedAvgState, FlatWeights, LocalTrainer, LocalUpdate};
pub use process::{ClientDataset, DatasetProvider, InMemoryClientData, IterativeProcess, RoundMetrics};
pub use sampler::{ClientId, ClientSampler};
