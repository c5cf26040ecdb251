//! Publication of trained weights to their read-only copies.
//!
//! A learner publishes by replacing the complete snapshot held by a
//! [`WeightStore`]; readers copy the snapshot into their own `VarStore` when
//! its version moved past the one they last synchronized. Readers therefore
//! always observe a fully formed weight set, never a partially written one.
use std::{collections::HashMap, sync::Mutex};
use tch::{nn::VarStore, no_grad, Tensor};

struct Snapshot {
    version: u64,
    tensors: HashMap<String, Tensor>,
}

fn detached_copies(vs: &VarStore) -> HashMap<String, Tensor> {
    no_grad(|| {
        vs.variables()
            .iter()
            .map(|(name, var)| (name.clone(), var.detach().copy().to_device(tch::Device::Cpu)))
            .collect()
    })
}

/// Versioned store of the most recently published weight snapshot.
pub struct WeightStore {
    inner: Mutex<Snapshot>,
}

impl WeightStore {
    /// Creates a store seeded with the current weights of `vs`.
    pub fn new(vs: &VarStore) -> Self {
        Self {
            inner: Mutex::new(Snapshot {
                version: 1,
                tensors: detached_copies(vs),
            }),
        }
    }

    /// Publishes the current weights of `vs` as a new complete snapshot.
    pub fn publish(&self, vs: &VarStore) {
        let tensors = detached_copies(vs);
        let mut snapshot = self.inner.lock().unwrap();
        snapshot.version += 1;
        snapshot.tensors = tensors;
    }

    /// The version of the latest snapshot.
    pub fn version(&self) -> u64 {
        self.inner.lock().unwrap().version
    }

    /// Copies the latest snapshot into `vs` when `version` is stale.
    ///
    /// Updates `version` and returns `true` when a copy happened.
    pub fn sync(&self, version: &mut u64, vs: &mut VarStore) -> bool {
        let snapshot = self.inner.lock().unwrap();
        if snapshot.version == *version {
            return false;
        }
        no_grad(|| {
            let mut dest = vs.variables();
            debug_assert_eq!(snapshot.tensors.len(), dest.len());
            for (name, src) in snapshot.tensors.iter() {
                let dest = dest.get_mut(name).unwrap();
                dest.copy_(src);
            }
        });
        *version = snapshot.version;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, nn::Init, Device};

    #[test]
    fn readers_see_published_values_only_after_sync() {
        let src = nn::VarStore::new(Device::Cpu);
        let w = src.root().var("w", &[2], Init::Const(1.0));
        let store = WeightStore::new(&src);

        let mut dest = nn::VarStore::new(Device::Cpu);
        let d = dest.root().var("w", &[2], Init::Const(0.0));
        let mut seen = 0u64;
        assert!(store.sync(&mut seen, &mut dest));
        assert_eq!(d.double_value(&[0]), 1.0);

        // A second sync at the same version is a no-op.
        assert!(!store.sync(&mut seen, &mut dest));

        no_grad(|| {
            let mut w = w;
            let _ = w.fill_(3.0);
        });
        // Not yet published: the reader still holds the old snapshot.
        assert!(!store.sync(&mut seen, &mut dest));
        assert_eq!(d.double_value(&[0]), 1.0);

        store.publish(&src);
        assert!(store.sync(&mut seen, &mut dest));
        assert_eq!(d.double_value(&[0]), 3.0);
    }
}
