//! The experiment checkpoint record.
//!
//! One bincode file holds everything needed to resume training: the policy
//! and discriminator weights, both optimizer states, both scheduler states,
//! the stats map and the full hyperparameter set. Each save replaces the
//! record wholesale; the file is written to a sibling temp path first and
//! renamed over the target, so a reader never observes a partial record.
use crate::config::TrainConfig;
use crate::opt::{OptimizerState, SchedulerState};
use anyhow::{bail, Context, Result};
use atelier_core::Stats;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    convert::TryFrom,
    fs,
    path::Path,
};
use tch::{nn::VarStore, no_grad, Device, Kind, Tensor};

/// A tensor flattened for serialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    /// Tensor shape.
    pub shape: Vec<i64>,

    /// Row-major float data.
    pub data: Vec<f32>,
}

impl TensorData {
    /// Captures a detached host copy of `tensor`.
    pub fn from_tensor(tensor: &Tensor) -> Self {
        let tensor = tensor
            .detach()
            .to_device(Device::Cpu)
            .to_kind(Kind::Float);
        Self {
            shape: tensor.size(),
            data: Vec::<f32>::try_from(&tensor.flatten(0, -1))
                .expect("tensor data is convertible to Vec<f32>"),
        }
    }

    /// Rebuilds the tensor on `device`.
    pub fn to_tensor(&self, device: Device) -> Tensor {
        Tensor::from_slice(&self.data)
            .reshape(&self.shape[..])
            .to_device(device)
    }
}

/// Captures all variables of `vs` by name.
pub fn weights_of(vs: &VarStore) -> HashMap<String, TensorData> {
    vs.variables()
        .iter()
        .map(|(name, var)| (name.clone(), TensorData::from_tensor(var)))
        .collect()
}

/// Restores previously captured variables into `vs`.
///
/// Every stored name must exist in `vs` with a matching shape.
pub fn load_weights(weights: &HashMap<String, TensorData>, vs: &mut VarStore) -> Result<()> {
    let mut vars = vs.variables();
    if weights.len() != vars.len() {
        bail!(
            "checkpoint holds {} variables, the network has {}",
            weights.len(),
            vars.len()
        );
    }
    no_grad(|| -> Result<()> {
        for (name, data) in weights.iter() {
            let var = vars
                .get_mut(name)
                .with_context(|| format!("variable {} missing from the network", name))?;
            if var.size() != data.shape {
                bail!(
                    "variable {} has shape {:?}, checkpoint holds {:?}",
                    name,
                    var.size(),
                    data.shape
                );
            }
            var.copy_(&data.to_tensor(var.device()));
        }
        Ok(())
    })
}

/// Snapshot of every persisted training component.
#[derive(Serialize, Deserialize)]
pub struct Checkpoint {
    /// Policy network weights.
    pub model: HashMap<String, TensorData>,

    /// Discriminator weights.
    pub discriminator: HashMap<String, TensorData>,

    /// Policy optimizer state.
    pub optimizer: OptimizerState,

    /// Discriminator optimizer state.
    pub d_optimizer: OptimizerState,

    /// Policy learning-rate schedule state.
    pub scheduler: SchedulerState,

    /// Discriminator learning-rate schedule state.
    pub d_scheduler: SchedulerState,

    /// Stats map at save time.
    pub stats: Stats,

    /// The full hyperparameter set the run was started with.
    pub config: TrainConfig,
}

impl Checkpoint {
    /// Writes the record, replacing any previous one atomically.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = bincode::serialize(self)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).with_context(|| format!("writing {:?}", tmp))?;
        fs::rename(&tmp, path).with_context(|| format!("renaming into {:?}", path))?;
        info!("Saved checkpoint to {:?}", path);
        Ok(())
    }

    /// Reads a record back.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("reading {:?}", path))?;
        let checkpoint = bincode::deserialize(&bytes)?;
        info!("Loaded checkpoint from {:?}", path);
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{PolicyNet, PolicyNetConfig};
    use crate::opt::OptimizerConfig;
    use atelier_core::StatValue;
    use tch::nn;
    use tempdir::TempDir;

    fn net_config() -> PolicyNetConfig {
        PolicyNetConfig {
            obs_shape: (1, 16, 16),
            action_dims: vec![4],
            hidden_dim: 16,
        }
    }

    #[test]
    fn weights_round_trip_through_tensor_data() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let _net = PolicyNet::new(&vs, &net_config());
        let weights = weights_of(&vs);

        tch::manual_seed(1);
        let mut other = nn::VarStore::new(Device::Cpu);
        let _other_net = PolicyNet::new(&other, &net_config());
        load_weights(&weights, &mut other).unwrap();
        assert_eq!(weights, weights_of(&other));
    }

    #[test]
    fn record_replaces_the_previous_file() {
        tch::manual_seed(0);
        let dir = TempDir::new("atelier-checkpoint").unwrap();
        let path = dir.path().join("checkpoint.bin");

        let vs = nn::VarStore::new(Device::Cpu);
        let _net = PolicyNet::new(&vs, &net_config());
        let opt = OptimizerConfig::adam(1e-3).build();
        let mut stats = Stats::empty();
        stats.insert("step", StatValue::Int(40));

        let checkpoint = Checkpoint {
            model: weights_of(&vs),
            discriminator: HashMap::new(),
            optimizer: opt.state(),
            d_optimizer: opt.state(),
            scheduler: SchedulerState { n_updates: 2 },
            d_scheduler: SchedulerState { n_updates: 3 },
            stats,
            config: TrainConfig::default(),
        };
        checkpoint.save(&path).unwrap();
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.stats.int("step"), 40);
        assert_eq!(loaded.scheduler.n_updates, 2);
        assert_eq!(loaded.d_scheduler.n_updates, 3);
        assert!(!loaded.model.is_empty());
        assert!(!dir.path().join("checkpoint.tmp").exists());
    }
}
