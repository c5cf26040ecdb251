//! Reference networks: the recurrent painting policy and the canvas
//! discriminator.
//!
//! The architectures here are deliberately small; the training core only
//! relies on their interfaces (forward shapes and the recurrent state).
use crate::batch::AgentOutput;
use serde::{Deserialize, Serialize};
use tch::{
    nn,
    nn::{Module, ModuleT, RNN},
    Device, Kind, Tensor,
};

/// Weight-initialization role of a discriminator layer.
///
/// The role is resolved when the layer is constructed, and selects the
/// explicit [`nn::Init`] the layer's parameters are created with.
#[derive(Clone, Copy, Debug)]
pub enum LayerRole {
    /// Convolutional layers.
    Convolution,

    /// Normalization scale/bias layers.
    Normalization,

    /// Everything else keeps the library defaults.
    Other,
}

impl LayerRole {
    /// Initialization of the layer's weight.
    pub fn weight_init(self) -> nn::Init {
        match self {
            LayerRole::Convolution => nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
            LayerRole::Normalization => nn::Init::Randn {
                mean: 1.0,
                stdev: 0.02,
            },
            LayerRole::Other => nn::init::DEFAULT_KAIMING_UNIFORM,
        }
    }

    /// Initialization of the layer's bias.
    pub fn bias_init(self) -> nn::Init {
        nn::Init::Const(0.0)
    }
}

/// Configuration of [`PolicyNet`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PolicyNetConfig {
    /// Observed canvas shape `(C, H, W)`.
    pub obs_shape: (i64, i64, i64),

    /// Cardinality of each independent action dimension.
    pub action_dims: Vec<i64>,

    /// Width of the encoder output and the recurrent core.
    pub hidden_dim: i64,
}

/// The recurrent painting policy.
///
/// A convolutional canvas encoder feeds a single-layer GRU; one linear head
/// per action dimension produces the policy logits, a scalar head the value
/// estimate. The recurrent state is reset wherever `done` is set, so
/// unrolls crossing an episode boundary do not leak state.
pub struct PolicyNet {
    device: Device,
    hidden_dim: i64,
    encoder: nn::Sequential,
    core: nn::GRU,
    policy_heads: Vec<nn::Linear>,
    baseline_head: nn::Linear,
}

impl PolicyNet {
    fn stride2() -> nn::ConvConfig {
        nn::ConvConfig {
            stride: 2,
            padding: 1,
            ..Default::default()
        }
    }

    /// Builds the policy network inside `vs`.
    pub fn new(vs: &nn::VarStore, config: &PolicyNetConfig) -> Self {
        let p = &vs.root();
        let (c, _h, _w) = config.obs_shape;
        let hidden = config.hidden_dim;
        let encoder = nn::seq()
            .add(nn::conv2d(p / "c1", c, 32, 3, Self::stride2()))
            .add_fn(|xs| xs.relu())
            .add(nn::conv2d(p / "c2", 32, 64, 3, Self::stride2()))
            .add_fn(|xs| xs.relu())
            .add(nn::conv2d(p / "c3", 64, 64, 3, Self::stride2()))
            .add_fn(|xs| xs.relu().adaptive_avg_pool2d([4, 4]).flat_view())
            .add(nn::linear(p / "l1", 64 * 16, hidden, Default::default()))
            .add_fn(|xs| xs.relu());
        let core = nn::gru(&(p / "core"), hidden, hidden, Default::default());
        let policy_heads = config
            .action_dims
            .iter()
            .enumerate()
            .map(|(d, n_act)| {
                nn::linear(
                    p / format!("policy{}", d).as_str(),
                    hidden,
                    *n_act,
                    Default::default(),
                )
            })
            .collect();
        let baseline_head = nn::linear(p / "baseline", hidden, 1, Default::default());

        Self {
            device: vs.device(),
            hidden_dim: hidden,
            encoder,
            core,
            policy_heads,
            baseline_head,
        }
    }

    /// The recurrent state before the first step of an episode.
    pub fn initial_state(&self, batch_size: i64) -> Tensor {
        Tensor::zeros([batch_size, self.hidden_dim], (Kind::Float, self.device))
    }

    /// Runs the policy over a time-major unroll.
    ///
    /// `canvas` is `[T, B, C, H, W]`, `done` is `[T, B]` (`Kind::Bool`) and
    /// `state` is `[B, H]`. Returns the agent outputs for every timestep and
    /// the recurrent state after the last one.
    pub fn forward(&self, canvas: &Tensor, done: &Tensor, state: &Tensor) -> (AgentOutput, Tensor) {
        let size = canvas.size();
        let (t, b) = (size[0], size[1]);
        let flat = canvas.view([-1, size[2], size[3], size[4]]);
        let features = self.encoder.forward(&flat).view([t, b, self.hidden_dim]);

        let keep = done.logical_not().to_kind(Kind::Float);
        let mut state = state.shallow_clone();
        let mut core_outputs = Vec::with_capacity(t as usize);
        for i in 0..t {
            state = state * keep.get(i).unsqueeze(-1);
            let next = self
                .core
                .step(&features.get(i), &nn::GRUState(state.unsqueeze(0)));
            state = next.0.squeeze_dim(0);
            core_outputs.push(state.shallow_clone());
        }
        let core = Tensor::stack(&core_outputs, 0).view([-1, self.hidden_dim]);

        let mut policy_logits = Vec::with_capacity(self.policy_heads.len());
        let mut actions = Vec::with_capacity(self.policy_heads.len());
        for head in &self.policy_heads {
            let logits = core.apply(head);
            let action = logits
                .softmax(-1, Kind::Float)
                .multinomial(1, true)
                .view([t, b]);
            policy_logits.push(logits.view([t, b, -1]));
            actions.push(action);
        }
        let action = Tensor::stack(&actions, 2);
        let baseline = core.apply(&self.baseline_head).view([t, b]);

        (
            AgentOutput {
                action,
                policy_logits,
                baseline,
            },
            state,
        )
    }
}

/// Configuration of [`Discriminator`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DiscriminatorConfig {
    /// Scored canvas shape `(C, H, W)`; already doubled channel-wise when the
    /// discriminator is conditioned.
    pub obs_shape: (i64, i64, i64),
}

/// The canvas discriminator.
///
/// A strided convolutional stack with batch normalization; parameters are
/// created with the per-role initialization of [`LayerRole`].
pub struct Discriminator {
    seq: nn::SequentialT,
}

impl Discriminator {
    fn conv(stride: i64) -> nn::ConvConfig {
        nn::ConvConfig {
            stride,
            padding: 1,
            ws_init: LayerRole::Convolution.weight_init(),
            bs_init: LayerRole::Convolution.bias_init(),
            ..Default::default()
        }
    }

    fn norm() -> nn::BatchNormConfig {
        nn::BatchNormConfig {
            ws_init: LayerRole::Normalization.weight_init(),
            bs_init: LayerRole::Normalization.bias_init(),
            ..Default::default()
        }
    }

    /// Builds the discriminator inside `vs`.
    pub fn new(vs: &nn::VarStore, config: &DiscriminatorConfig) -> Self {
        let p = &vs.root();
        let (c, _h, _w) = config.obs_shape;
        let seq = nn::seq_t()
            .add(nn::conv2d(p / "c1", c, 64, 4, Self::conv(2)))
            .add_fn(|xs| xs.leaky_relu())
            .add(nn::conv2d(p / "c2", 64, 128, 4, Self::conv(2)))
            .add(nn::batch_norm2d(p / "n2", 128, Self::norm()))
            .add_fn(|xs| xs.leaky_relu())
            .add(nn::conv2d(p / "c3", 128, 256, 4, Self::conv(2)))
            .add(nn::batch_norm2d(p / "n3", 256, Self::norm()))
            .add_fn(|xs| xs.leaky_relu())
            .add_fn(|xs| xs.adaptive_avg_pool2d([1, 1]).flat_view())
            .add(nn::linear(
                p / "score",
                256,
                1,
                nn::LinearConfig {
                    ws_init: LayerRole::Other.weight_init(),
                    bs_init: Some(LayerRole::Other.bias_init()),
                    ..Default::default()
                },
            ));
        Self { seq }
    }

    /// Scores a batch of canvases, `[N, C, H, W]` to raw logits `[N]`.
    pub fn forward(&self, canvas: &Tensor, train: bool) -> Tensor {
        self.seq.forward_t(canvas, train).squeeze_dim(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_shapes_match_the_unroll() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let config = PolicyNetConfig {
            obs_shape: (1, 16, 16),
            action_dims: vec![4, 6],
            hidden_dim: 32,
        };
        let net = PolicyNet::new(&vs, &config);

        let (t, b) = (3, 2);
        let canvas = Tensor::zeros([t, b, 1, 16, 16], (Kind::Float, Device::Cpu));
        let done = Tensor::zeros([t, b], (Kind::Float, Device::Cpu)).to_kind(Kind::Bool);
        let state = net.initial_state(b);
        let (out, next_state) = net.forward(&canvas, &done, &state);

        assert_eq!(out.action.size(), vec![t, b, 2]);
        assert_eq!(out.policy_logits.len(), 2);
        assert_eq!(out.policy_logits[0].size(), vec![t, b, 4]);
        assert_eq!(out.policy_logits[1].size(), vec![t, b, 6]);
        assert_eq!(out.baseline.size(), vec![t, b]);
        assert_eq!(next_state.size(), vec![b, 32]);
    }

    #[test]
    fn discriminator_scores_one_logit_per_canvas() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let config = DiscriminatorConfig {
            obs_shape: (1, 16, 16),
        };
        let d = Discriminator::new(&vs, &config);
        let canvas = Tensor::rand([5, 1, 16, 16], (Kind::Float, Device::Cpu));
        assert_eq!(d.forward(&canvas, true).size(), vec![5]);
    }
}
