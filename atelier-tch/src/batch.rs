//! Rollout data exchanged between the actor driver and the learner loops.
//!
//! All sequence tensors are time-major, `[T, B, ...]`; index 0 along the time
//! dimension is the observation preceding the first action of the unroll.
use atelier_core::Stackable;
use tch::{Device, Tensor};

/// Environment-side outputs of a rollout, one cell per (timestep, actor).
pub struct EnvOutput {
    /// Rendered canvases, `[T, B, C, H, W]`.
    pub canvas: Tensor,

    /// Environment rewards, `[T, B]`.
    pub reward: Tensor,

    /// Episode-boundary flags, `[T, B]`, `Kind::Bool`.
    pub done: Tensor,

    /// Step index within the episode, `[T, B]`.
    pub episode_step: Tensor,

    /// Cumulative return of the episode so far, `[T, B]`.
    pub episode_return: Tensor,
}

impl EnvOutput {
    /// Moves every tensor to `device`.
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            canvas: self.canvas.to_device(device),
            reward: self.reward.to_device(device),
            done: self.done.to_device(device),
            episode_step: self.episode_step.to_device(device),
            episode_return: self.episode_return.to_device(device),
        }
    }

    /// Narrows every tensor along the time dimension.
    pub fn narrow_time(&self, start: i64, len: i64) -> Self {
        Self {
            canvas: self.canvas.narrow(0, start, len),
            reward: self.reward.narrow(0, start, len),
            done: self.done.narrow(0, start, len),
            episode_step: self.episode_step.narrow(0, start, len),
            episode_return: self.episode_return.narrow(0, start, len),
        }
    }
}

/// Agent-side outputs of a rollout, indexed like [`EnvOutput`].
pub struct AgentOutput {
    /// Sampled actions, `[T, B, D]` with one integer per action dimension.
    pub action: Tensor,

    /// Policy logits, one `[T, B, A_d]` tensor per action dimension.
    pub policy_logits: Vec<Tensor>,

    /// Value estimates, `[T, B]`.
    pub baseline: Tensor,
}

impl AgentOutput {
    /// Moves every tensor to `device`.
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            action: self.action.to_device(device),
            policy_logits: self
                .policy_logits
                .iter()
                .map(|t| t.to_device(device))
                .collect(),
            baseline: self.baseline.to_device(device),
        }
    }

    /// Narrows every tensor along the time dimension.
    pub fn narrow_time(&self, start: i64, len: i64) -> Self {
        Self {
            action: self.action.narrow(0, start, len),
            policy_logits: self
                .policy_logits
                .iter()
                .map(|t| t.narrow(0, start, len))
                .collect(),
            baseline: self.baseline.narrow(0, start, len),
        }
    }
}

/// One learner batch: paired rollout outputs plus the initial recurrent state
/// and the unroll-final canvases.
///
/// Episodes are unroll-aligned, so the final canvas of an unroll that ends an
/// episode is that episode's completed painting.
pub struct TrajectoryBatch {
    /// Environment-side rollout data.
    pub env: EnvOutput,

    /// Behavior-policy rollout data.
    pub agent: AgentOutput,

    /// Recurrent state at the start of the unroll, `[B, H]`.
    pub initial_state: Tensor,

    /// Canvas at the end of the unroll, `[1, B, C, H, W]`.
    pub final_canvas: Tensor,
}

impl TrajectoryBatch {
    /// Moves every tensor to `device`.
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            env: self.env.to_device(device),
            agent: self.agent.to_device(device),
            initial_state: self.initial_state.to_device(device),
            final_canvas: self.final_canvas.to_device(device),
        }
    }
}

fn cat_field<'a>(items: &'a [TrajectoryBatch], dim: i64, f: impl Fn(&'a TrajectoryBatch) -> &'a Tensor) -> Tensor {
    let tensors: Vec<&Tensor> = items.iter().map(f).collect();
    Tensor::cat(&tensors, dim)
}

impl Stackable for TrajectoryBatch {
    fn stack(batch_dim: i64, items: Vec<Self>) -> Self {
        let n_dims = items[0].agent.policy_logits.len();
        let policy_logits = (0..n_dims)
            .map(|d| {
                let tensors: Vec<&Tensor> =
                    items.iter().map(|i| &i.agent.policy_logits[d]).collect();
                Tensor::cat(&tensors, batch_dim)
            })
            .collect();
        Self {
            env: EnvOutput {
                canvas: cat_field(&items, batch_dim, |i| &i.env.canvas),
                reward: cat_field(&items, batch_dim, |i| &i.env.reward),
                done: cat_field(&items, batch_dim, |i| &i.env.done),
                episode_step: cat_field(&items, batch_dim, |i| &i.env.episode_step),
                episode_return: cat_field(&items, batch_dim, |i| &i.env.episode_return),
            },
            agent: AgentOutput {
                action: cat_field(&items, batch_dim, |i| &i.agent.action),
                policy_logits,
                baseline: cat_field(&items, batch_dim, |i| &i.agent.baseline),
            },
            // The recurrent state has no time dimension; its batch dim is 0.
            initial_state: cat_field(&items, 0, |i| &i.initial_state),
            final_canvas: cat_field(&items, batch_dim, |i| &i.final_canvas),
        }
    }
}

/// A batch of terminal canvases on the replay queue, `[1, B, C, H, W]`.
pub struct CanvasBatch(pub Tensor);

impl Stackable for CanvasBatch {
    fn stack(batch_dim: i64, items: Vec<Self>) -> Self {
        let tensors: Vec<Tensor> = items.into_iter().map(|i| i.0).collect();
        CanvasBatch(Tensor::cat(&tensors, batch_dim))
    }
}
