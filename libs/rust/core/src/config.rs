//! Experiment configuration.
//!
//! Built once at startup from defaults, an optional file and `FEDSIM__*`
//! environment overrides, then passed by reference to whatever needs it.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FedError, Result};
use crate::tasks::{TaskName, EMNIST_MODELS};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Required; one of [`TaskName::ALL`].
    pub task: Option<String>,
    pub experiment_name: String,
    pub total_rounds: u64,
    pub rounds_per_eval: u64,
    pub client_epochs_per_round: usize,
    pub client_batch_size: usize,
    pub clients_per_round: usize,
    /// `None` draws clients without a reproducible seed.
    pub client_datasets_random_seed: Option<u64>,
    pub client_learning_rate: f32,
    pub server_learning_rate: f32,
    pub cifar100: Cifar100Config,
    pub emnist_cr: EmnistCrConfig,
    pub shakespeare: ShakespeareConfig,
    pub so_nwp: StackOverflowNwpConfig,
    pub so_lr: StackOverflowLrConfig,
    pub simulation: SimulationConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            task: None,
            experiment_name: "federated_experiment".into(),
            total_rounds: 200,
            rounds_per_eval: 1,
            client_epochs_per_round: 1,
            client_batch_size: 20,
            clients_per_round: 10,
            client_datasets_random_seed: Some(1),
            client_learning_rate: 0.1,
            server_learning_rate: 1.0,
            cifar100: Cifar100Config::default(),
            emnist_cr: EmnistCrConfig::default(),
            shakespeare: ShakespeareConfig::default(),
            so_nwp: StackOverflowNwpConfig::default(),
            so_lr: StackOverflowLrConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Cifar100Config { pub crop_size: usize }
impl Default for Cifar100Config { fn default() -> Self { Self { crop_size: 24 } } }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmnistCrConfig {
    /// `cnn` or `2nn`.
    pub model: String,
}
impl Default for EmnistCrConfig { fn default() -> Self { Self { model: "cnn".into() } } }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShakespeareConfig { pub sequence_length: usize }
impl Default for ShakespeareConfig { fn default() -> Self { Self { sequence_length: 80 } } }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackOverflowNwpConfig {
    pub vocab_size: usize,
    pub num_oov_buckets: usize,
    pub sequence_length: usize,
    pub max_elements_per_user: usize,
    pub num_validation_examples: usize,
    pub embedding_size: usize,
    pub latent_size: usize,
    pub num_layers: usize,
    pub shared_embedding: bool,
}

impl Default for StackOverflowNwpConfig {
    fn default() -> Self {
        Self {
            vocab_size: 10000,
            num_oov_buckets: 1,
            sequence_length: 20,
            max_elements_per_user: 1000,
            num_validation_examples: 10000,
            embedding_size: 96,
            latent_size: 670,
            num_layers: 1,
            shared_embedding: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackOverflowLrConfig {
    pub vocab_tokens_size: usize,
    pub vocab_tags_size: usize,
    pub num_validation_examples: usize,
    pub max_elements_per_user: usize,
}

impl Default for StackOverflowLrConfig {
    fn default() -> Self { Self { vocab_tokens_size: 10000, vocab_tags_size: 500, num_validation_examples: 10000, max_elements_per_user: 1000 } }
}

/// Population of the synthetic backend used by the bundled trainer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub num_clients: usize,
    pub examples_per_client: usize,
    pub held_out_examples: usize,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self { Self { num_clients: 50, examples_per_client: 40, held_out_examples: 400, seed: 7 } }
}

impl ExperimentConfig {
    /// Checks every value that can be checked without data and returns the
    /// selected task.
    pub fn validate(&self) -> Result<TaskName> {
        let task = match &self.task {
            Some(name) => TaskName::from_str(name)?,
            None => return Err(FedError::invalid_choice("task", "<unset>", &TaskName::names())),
        };
        if task == TaskName::EmnistCr && !EMNIST_MODELS.contains(&self.emnist_cr.model.as_str()) {
            return Err(FedError::invalid_choice("emnist_cr.model", self.emnist_cr.model.clone(), &EMNIST_MODELS));
        }
        positive("clients_per_round", self.clients_per_round as u64)?;
        positive("rounds_per_eval", self.rounds_per_eval)?;
        positive("client_batch_size", self.client_batch_size as u64)?;
        positive("client_epochs_per_round", self.client_epochs_per_round as u64)?;
        positive("simulation.num_clients", self.simulation.num_clients as u64)?;
        match task {
            TaskName::StackoverflowNwp => {
                positive("so_nwp.vocab_size", self.so_nwp.vocab_size as u64)?;
                positive("so_nwp.num_oov_buckets", self.so_nwp.num_oov_buckets as u64)?;
                positive("so_nwp.sequence_length", self.so_nwp.sequence_length as u64)?;
            }
            TaskName::StackoverflowLr => positive("so_lr.vocab_tags_size", self.so_lr.vocab_tags_size as u64)?,
            TaskName::Shakespeare => positive("shakespeare.sequence_length", self.shakespeare.sequence_length as u64)?,
            _ => {}
        }
        Ok(task)
    }

    /// Layers a YAML document over the defaults, ignoring the environment.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Config::try_from(&ExperimentConfig::default())?)
            .add_source(config::File::from_str(text, config::FileFormat::Yaml))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}

fn positive(field: &'static str, value: u64) -> Result<()> {
    if value == 0 { return Err(FedError::out_of_range(field, value, ">= 1")); }
    Ok(())
}

/// Defaults, then `path` (or `FEDSIM_CONFIG_FILE`), then `FEDSIM__*` env vars.
pub fn load_config(path: Option<&Path>) -> Result<ExperimentConfig> {
    let mut builder = config::Config::builder().add_source(config::Config::try_from(&ExperimentConfig::default())?);
    let file: Option<PathBuf> = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("FEDSIM_CONFIG_FILE").ok().map(PathBuf::from));
    if let Some(f) = &file {
        builder = builder.add_source(config::File::from(f.as_path()).required(true));
    }
    builder = builder.add_source(config::Environment::with_prefix("FEDSIM").separator("__").try_parsing(true));
    let cfg: ExperimentConfig = builder.build()?.try_deserialize()?;
    info!(file = ?file, task = ?cfg.task, "config_loaded");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_trainer_flags() {
        let c = ExperimentConfig::default();
        assert_eq!(c.clients_per_round, 10);
        assert_eq!(c.client_epochs_per_round, 1);
        assert_eq!(c.client_batch_size, 20);
        assert_eq!(c.client_datasets_random_seed, Some(1));
        assert_eq!(c.so_nwp.sequence_length, 20);
        assert_eq!(c.so_nwp.vocab_size, 10000);
        assert_eq!(c.so_nwp.num_validation_examples, 10000);
        assert_eq!(c.shakespeare.sequence_length, 80);
        assert_eq!(c.cifar100.crop_size, 24);
    }

    #[test]
    fn yaml_overrides_nested_fields() {
        let c = ExperimentConfig::from_yaml("task: stackoverflow_nwp\nclients_per_round: 3\nso_nwp:\n  vocab_size: 50\n").unwrap();
        assert_eq!(c.task.as_deref(), Some("stackoverflow_nwp"));
        assert_eq!(c.clients_per_round, 3);
        assert_eq!(c.so_nwp.vocab_size, 50);
        assert_eq!(c.so_nwp.num_oov_buckets, 1);
        assert_eq!(c.validate().unwrap(), TaskName::StackoverflowNwp);
    }

    #[test]
    fn missing_task_is_configuration_error() {
        let err = ExperimentConfig::default().validate().unwrap_err();
        assert!(matches!(err, FedError::Configuration { field: "task", .. }));
    }

    #[test]
    fn unknown_task_names_allowed_set() {
        let c = ExperimentConfig { task: Some("mnist".into()), ..Default::default() };
        let msg = c.validate().unwrap_err().to_string();
        assert!(msg.contains("mnist"));
        assert!(msg.contains("stackoverflow_lr"));
    }

    #[test]
    fn unknown_emnist_model_rejected() {
        let mut c = ExperimentConfig { task: Some("emnist_cr".into()), ..Default::default() };
        c.emnist_cr.model = "resnet".into();
        let msg = c.validate().unwrap_err().to_string();
        assert!(msg.contains("resnet"));
        assert!(msg.contains("2nn"));
    }

    #[test]
    fn load_config_layers_env_over_file_over_defaults() {
        let path = std::env::temp_dir().join(format!("fedsim-config-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "task: stackoverflow_nwp\nclients_per_round: 3\nrounds_per_eval: 4\nso_nwp:\n  vocab_size: 50\n  sequence_length: 12\n",
        )
        .unwrap();
        std::env::set_var("FEDSIM__CLIENTS_PER_ROUND", "7");
        std::env::set_var("FEDSIM__SO_NWP__VOCAB_SIZE", "80");
        std::env::set_var("FEDSIM__SO_NWP__NUM_OOV_BUCKETS", "3");
        let loaded = load_config(Some(&path));
        std::env::remove_var("FEDSIM__CLIENTS_PER_ROUND");
        std::env::remove_var("FEDSIM__SO_NWP__VOCAB_SIZE");
        std::env::remove_var("FEDSIM__SO_NWP__NUM_OOV_BUCKETS");
        let _ = std::fs::remove_file(&path);

        let c = loaded.unwrap();
        // env
        assert_eq!(c.clients_per_round, 7);
        assert_eq!(c.so_nwp.vocab_size, 80);
        assert_eq!(c.so_nwp.num_oov_buckets, 3);
        // file
        assert_eq!(c.task.as_deref(), Some("stackoverflow_nwp"));
        assert_eq!(c.rounds_per_eval, 4);
        assert_eq!(c.so_nwp.sequence_length, 12);
        // defaults
        assert_eq!(c.client_batch_size, 20);
        assert_eq!(c.so_nwp.num_validation_examples, 10000);
        assert_eq!(c.validate().unwrap(), TaskName::StackoverflowNwp);
    }

    #[test]
    fn load_config_missing_file_is_an_error() {
        let path = std::env::temp_dir().join("fedsim-config-does-not-exist.yaml");
        assert!(matches!(load_config(Some(&path)), Err(FedError::Config(_))));
    }

    #[test]
    fn zero_cadence_rejected() {
        let c = ExperimentConfig { task: Some("cifar100".into()), rounds_per_eval: 0, ..Default::default() };
        assert!(matches!(c.validate().unwrap_err(), FedError::Configuration { field: "rounds_per_eval", .. }));
    }
}
