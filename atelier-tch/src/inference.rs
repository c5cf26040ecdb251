//! Batched inference serving on the published policy copy.
use crate::net::{PolicyNet, PolicyNetConfig};
use crate::publish::WeightStore;
use atelier_core::{DynamicBatcher, InferenceClient};
use std::sync::Mutex;
use tch::{nn::VarStore, no_grad, Device, Tensor};

/// One actor's pending inference request.
pub struct InferenceInput {
    /// Current canvas, `[1, 1, C, H, W]`.
    pub canvas: Tensor,

    /// Episode-boundary flag for this step, `[1, 1]`, `Kind::Bool`.
    pub done: Tensor,

    /// Prior recurrent state, `[1, H]`.
    pub state: Tensor,
}

/// The per-request result of a batched forward pass.
pub struct InferenceOutput {
    /// Sampled action, `[1, 1, D]`.
    pub action: Tensor,

    /// Policy logits, one `[1, 1, A_d]` tensor per action dimension.
    pub policy_logits: Vec<Tensor>,

    /// Value estimate, `[1, 1]`.
    pub baseline: Tensor,

    /// Recurrent state after this step, `[1, H]`.
    pub state: Tensor,
}

/// Server side of the inference batcher.
pub type InferenceBatcher = DynamicBatcher<InferenceInput, InferenceOutput>;

/// Request side of the inference batcher, used by the actor driver.
pub type InferenceRequester = InferenceClient<InferenceInput, InferenceOutput>;

/// The policy copy read by the inference servers.
///
/// The serving copy is only ever written by [`refresh`](Self::refresh), which
/// pulls the newest complete snapshot published by the policy learner.
pub struct ServingModel {
    device: Device,
    vs: VarStore,
    net: PolicyNet,
    version: u64,
}

impl ServingModel {
    /// Builds an uninitialized serving copy on `device`.
    pub fn new(device: Device, config: &PolicyNetConfig) -> Self {
        let vs = VarStore::new(device);
        let net = PolicyNet::new(&vs, config);
        Self {
            device,
            vs,
            net,
            version: 0,
        }
    }

    /// Pulls the newest published weights when this copy is stale.
    pub fn refresh(&mut self, store: &WeightStore) {
        store.sync(&mut self.version, &mut self.vs);
    }

    /// The recurrent state handed to a fresh actor.
    pub fn initial_state(&self) -> Tensor {
        self.net.initial_state(1)
    }
}

/// Serves batched forward passes until the batcher is closed.
///
/// The forward pass runs inside the serving-model mutex shared by every
/// inference thread, so a pass never observes a half-refreshed weight set.
/// No gradients are computed here.
pub fn run_inference(
    batcher: &InferenceBatcher,
    model: &Mutex<ServingModel>,
    store: &WeightStore,
) {
    while let Some(batch) = batcher.next_batch() {
        let inputs = batch.inputs();
        let n = inputs.len() as i64;
        let canvas = Tensor::cat(&inputs.iter().map(|i| &i.canvas).collect::<Vec<_>>(), 1);
        let done = Tensor::cat(&inputs.iter().map(|i| &i.done).collect::<Vec<_>>(), 1);
        let state = Tensor::cat(&inputs.iter().map(|i| &i.state).collect::<Vec<_>>(), 0);

        let mut model = model.lock().unwrap();
        let canvas = canvas.to_device(model.device);
        let done = done.to_device(model.device);
        let state = state.to_device(model.device);
        model.refresh(store);
        let (out, next_state) = no_grad(|| model.net.forward(&canvas, &done, &state));
        drop(model);

        let action = out.action.to_device(Device::Cpu);
        let policy_logits: Vec<Tensor> = out
            .policy_logits
            .iter()
            .map(|l| l.to_device(Device::Cpu))
            .collect();
        let baseline = out.baseline.to_device(Device::Cpu);
        let next_state = next_state.to_device(Device::Cpu);

        let outputs = (0..n)
            .map(|i| InferenceOutput {
                action: action.narrow(1, i, 1),
                policy_logits: policy_logits.iter().map(|l| l.narrow(1, i, 1)).collect(),
                baseline: baseline.narrow(1, i, 1),
                state: next_state.narrow(0, i, 1),
            })
            .collect();
        batch
            .set_outputs(outputs)
            .expect("one output per pending request");
    }
}
