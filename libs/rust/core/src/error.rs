//! Error taxonomy for experiment setup and the round loop.
//!
//! Configuration problems are detected before round 0; everything else aborts
//! the experiment from inside the round in which it happened.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FedError {
    #[error("invalid {field} `{value}`, must be one of {allowed}")]
    Configuration { field: &'static str, value: String, allowed: String },
    #[error("round {round}: client `{client_id}` could not be resolved to a dataset")]
    DataResolution { round: u64, client_id: String },
    #[error("round {round}: every sampled client reported zero weight")]
    AggregationDegenerate { round: u64 },
    #[error("client `{client_id}` reported invalid weight {weight}")]
    InvalidWeight { client_id: String, weight: f64 },
    #[error("local output `{key}`: {reason}")]
    InvalidLocalOutput { key: String, reason: String },
    #[error("parameter shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("process error: {0}")]
    Process(#[from] anyhow::Error),
}

impl FedError {
    /// Shorthand for a configuration error whose allowed set is a list of names.
    pub fn invalid_choice(field: &'static str, value: impl Into<String>, allowed: &[&str]) -> Self {
        FedError::Configuration { field, value: value.into(), allowed: format!("{allowed:?}") }
    }

    /// Configuration error for a numeric bound.
    pub fn out_of_range(field: &'static str, value: impl ToString, allowed: impl Into<String>) -> Self {
        FedError::Configuration { field, value: value.to_string(), allowed: allowed.into() }
    }
}

pub type Result<T> = std::result::Result<T, FedError>;
