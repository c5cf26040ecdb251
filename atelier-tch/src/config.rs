//! Training configuration.
use crate::net::{DiscriminatorConfig, PolicyNetConfig};
use anyhow::Result;
use atelier_core::error::AtelierError;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

/// The full hyperparameter set of one experiment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Basename of the pipes the external environment servers listen on.
    /// Has to be of the form `unix:/some/path`.
    pub pipes_basename: String,

    /// Experiment id; derived from the current time when absent.
    pub xpid: Option<String>,

    /// Root directory where experiment data is saved.
    pub savedir: String,

    /// Disables checkpoint writes entirely.
    pub disable_checkpoint: bool,

    /// Number of simulated actors.
    pub num_actors: usize,

    /// Total environment steps to train for.
    pub total_steps: usize,

    /// Learner batch size.
    pub batch_size: usize,

    /// Number of policy-learner threads.
    pub num_learner_threads: usize,

    /// Number of inference-serving threads.
    pub num_inference_threads: usize,

    /// Disables the accelerator even when one is available.
    pub disable_cuda: bool,

    /// Replay buffer capacity; defaults to `batch_size * 20`.
    pub replay_buffer_size: Option<usize>,

    /// Bound on pending learner-queue items; defaults to `batch_size`.
    pub max_learner_queue_size: Option<usize>,

    /// The unroll length (time dimension).
    pub unroll_length: usize,

    /// Conditions the discriminator on the target image.
    pub condition: bool,

    /// Spreads the terminal discriminator reward across the episode.
    pub use_tca: bool,

    /// Entropy cost/multiplier.
    pub entropy_cost: f64,

    /// Baseline cost/multiplier.
    pub baseline_cost: f64,

    /// Discounting factor.
    pub discounting: f64,

    /// Policy learning rate.
    pub policy_learning_rate: f64,

    /// Discriminator learning rate.
    pub discriminator_learning_rate: f64,

    /// Global gradient norm clip.
    pub grad_norm_clipping: f64,

    /// Observed canvas shape `(C, H, W)`.
    pub obs_shape: (i64, i64, i64),

    /// Cardinality of each independent action dimension.
    pub action_dims: Vec<i64>,

    /// Width of the policy's recurrent core.
    pub hidden_dim: i64,

    /// Wait before the replay and inference queues release a partial batch,
    /// in milliseconds.
    pub queue_timeout_ms: u64,

    /// Monitor poll interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Interval between periodic checkpoint writes, in seconds.
    pub checkpoint_interval_secs: u64,

    /// Bound on waiting for the replay feed before reporting a stall, in
    /// seconds.
    pub replay_stall_timeout_secs: u64,

    /// Seed for replay sampling and weight initialization.
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            pipes_basename: "unix:/tmp/atelier".to_string(),
            xpid: None,
            savedir: "~/logs/atelier".to_string(),
            disable_checkpoint: false,
            num_actors: 4,
            total_steps: 100_000,
            batch_size: 64,
            num_learner_threads: 2,
            num_inference_threads: 2,
            disable_cuda: false,
            replay_buffer_size: None,
            max_learner_queue_size: None,
            unroll_length: 20,
            condition: false,
            use_tca: false,
            entropy_cost: 0.01,
            baseline_cost: 0.5,
            discounting: 0.99,
            policy_learning_rate: 3e-4,
            discriminator_learning_rate: 1e-4,
            grad_norm_clipping: 40.0,
            obs_shape: (1, 64, 64),
            action_dims: vec![1024, 1024, 6],
            hidden_dim: 256,
            queue_timeout_ms: 100,
            poll_interval_ms: 5_000,
            checkpoint_interval_secs: 600,
            replay_stall_timeout_secs: 60,
            seed: 42,
        }
    }
}

impl TrainConfig {
    /// Constructs a [`TrainConfig`] from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let config = serde_yaml::from_reader(rdr)?;
        Ok(config)
    }

    /// Saves the configuration as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(self)?.as_bytes())?;
        Ok(())
    }

    /// Rejects malformed configurations. Fatal at startup.
    pub fn validate(&self) -> Result<(), AtelierError> {
        if !self.pipes_basename.starts_with("unix:") {
            return Err(AtelierError::InvalidConfig(
                "pipes_basename has to be of the form unix:/some/path".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(AtelierError::InvalidConfig("batch_size must be positive".to_string()));
        }
        if self.unroll_length == 0 {
            return Err(AtelierError::InvalidConfig(
                "unroll_length must be positive".to_string(),
            ));
        }
        if self.total_steps == 0 {
            return Err(AtelierError::InvalidConfig(
                "total_steps must be positive".to_string(),
            ));
        }
        if self.action_dims.is_empty() {
            return Err(AtelierError::InvalidConfig(
                "at least one action dimension is required".to_string(),
            ));
        }
        if self.num_actors == 0 || self.num_learner_threads == 0 || self.num_inference_threads == 0
        {
            return Err(AtelierError::InvalidConfig(
                "actor and thread counts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The experiment id, derived from the current time when not configured.
    pub fn resolve_xpid(&self) -> String {
        match &self.xpid {
            Some(xpid) => xpid.clone(),
            None => format!("atelier-{}", Local::now().format("%Y%m%d-%H%M%S")),
        }
    }

    fn expanded_savedir(&self) -> PathBuf {
        if let Some(rest) = self.savedir.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.savedir)
    }

    /// Where the checkpoint record of `xpid` lives.
    pub fn checkpoint_path(&self, xpid: &str) -> PathBuf {
        self.expanded_savedir().join(xpid).join("checkpoint.bin")
    }

    /// Where the stats log of `xpid` lives.
    pub fn stats_log_path(&self, xpid: &str) -> PathBuf {
        self.expanded_savedir().join(xpid).join("stats.jsonl")
    }

    /// Replay buffer capacity, defaulted to twenty learner batches.
    pub fn replay_capacity(&self) -> usize {
        self.replay_buffer_size.unwrap_or(self.batch_size * 20)
    }

    /// Bound on pending learner-queue items.
    pub fn learner_queue_bound(&self) -> usize {
        self.max_learner_queue_size.unwrap_or(self.batch_size)
    }

    /// Configuration of the policy network.
    pub fn policy_net_config(&self) -> PolicyNetConfig {
        PolicyNetConfig {
            obs_shape: self.obs_shape,
            action_dims: self.action_dims.clone(),
            hidden_dim: self.hidden_dim,
        }
    }

    /// Configuration of the discriminator.
    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        DiscriminatorConfig {
            obs_shape: self.obs_shape,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn yaml_round_trip() {
        let dir = TempDir::new("atelier-config").unwrap();
        let path = dir.path().join("train.yaml");
        let config = TrainConfig {
            use_tca: true,
            batch_size: 8,
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = TrainConfig::load(&path).unwrap();
        assert_eq!(loaded.batch_size, 8);
        assert!(loaded.use_tca);
    }

    #[test]
    fn malformed_pipe_address_is_rejected() {
        let config = TrainConfig {
            pipes_basename: "tcp:localhost".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn derived_defaults_follow_the_batch_size() {
        let config = TrainConfig {
            batch_size: 16,
            ..Default::default()
        };
        assert_eq!(config.replay_capacity(), 320);
        assert_eq!(config.learner_queue_bound(), 16);
    }
}
