//! Optimizers and learning-rate schedules.
//!
//! The Adam implementation keeps its moment estimates as named tensors so the
//! full optimizer state can travel inside a checkpoint record, which the
//! `tch` built-in optimizers do not expose.
use crate::checkpoint::TensorData;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tch::{nn::VarStore, no_grad, Tensor};

/// Configures an optimizer for one of the training networks.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum OptimizerConfig {
    /// Adam optimizer.
    Adam {
        /// Learning rate.
        lr: f64,
        /// First-moment decay.
        beta1: f64,
        /// Second-moment decay.
        beta2: f64,
        /// Denominator fuzz term.
        eps: f64,
    },
}

impl OptimizerConfig {
    /// Adam with the library's default betas.
    pub fn adam(lr: f64) -> Self {
        OptimizerConfig::Adam {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }

    /// Adam with the betas commonly used for GAN discriminators.
    pub fn adam_gan(lr: f64) -> Self {
        OptimizerConfig::Adam {
            lr,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-8,
        }
    }

    /// Constructs the optimizer.
    pub fn build(&self) -> Optimizer {
        match *self {
            OptimizerConfig::Adam {
                lr,
                beta1,
                beta2,
                eps,
            } => Optimizer {
                lr,
                beta1,
                beta2,
                eps,
                t: 0,
                m: HashMap::new(),
                v: HashMap::new(),
            },
        }
    }
}

/// Serializable snapshot of an [`Optimizer`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizerState {
    /// Number of applied steps.
    pub t: i64,

    /// Learning rate at snapshot time.
    pub lr: f64,

    /// First-moment estimates by variable name.
    pub m: HashMap<String, TensorData>,

    /// Second-moment estimates by variable name.
    pub v: HashMap<String, TensorData>,
}

/// Adam over the variables of one [`VarStore`].
pub struct Optimizer {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: i64,
    m: HashMap<String, Tensor>,
    v: HashMap<String, Tensor>,
}

impl Optimizer {
    /// Clears the gradients of all variables in `vs`.
    pub fn zero_grad(&self, vs: &VarStore) {
        for (_, var) in vs.variables() {
            let mut grad = var.grad();
            if grad.defined() {
                let _ = grad.zero_();
            }
        }
    }

    /// Applies one update from the accumulated gradients.
    pub fn step(&mut self, vs: &VarStore) {
        self.t += 1;
        let correction1 = 1.0 - self.beta1.powi(self.t as i32);
        let correction2 = 1.0 - self.beta2.powi(self.t as i32);

        no_grad(|| {
            for (name, var) in vs.variables() {
                let grad = var.grad();
                if !grad.defined() {
                    continue;
                }
                let m = self
                    .m
                    .entry(name.clone())
                    .or_insert_with(|| Tensor::zeros_like(&var));
                let new_m = &*m * self.beta1 + &grad * (1.0 - self.beta1);
                m.copy_(&new_m);
                let v = self
                    .v
                    .entry(name)
                    .or_insert_with(|| Tensor::zeros_like(&var));
                let new_v = &*v * self.beta2 + &grad * &grad * (1.0 - self.beta2);
                v.copy_(&new_v);

                let m_hat = &*m / correction1;
                let v_hat = &*v / correction2;
                let update = m_hat / (v_hat.sqrt() + self.eps) * self.lr;
                let mut var = var;
                var -= update;
            }
        });
    }

    /// Sets the learning rate applied by subsequent steps.
    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// The current learning rate.
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Exports the optimizer state for checkpointing.
    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            t: self.t,
            lr: self.lr,
            m: self
                .m
                .iter()
                .map(|(k, t)| (k.clone(), TensorData::from_tensor(t)))
                .collect(),
            v: self
                .v
                .iter()
                .map(|(k, t)| (k.clone(), TensorData::from_tensor(t)))
                .collect(),
        }
    }

    /// Restores the optimizer state from a checkpoint, on `device` of `vs`.
    pub fn load_state(&mut self, state: &OptimizerState, vs: &VarStore) {
        let device = vs.device();
        self.t = state.t;
        self.lr = state.lr;
        self.m = state
            .m
            .iter()
            .map(|(k, t)| (k.clone(), t.to_tensor(device)))
            .collect();
        self.v = state
            .v
            .iter()
            .map(|(k, t)| (k.clone(), t.to_tensor(device)))
            .collect();
    }
}

/// Rescales all gradients of `vs` so their global norm stays within
/// `max_norm`.
pub fn clip_grad_norm(vs: &VarStore, max_norm: f64) {
    no_grad(|| {
        let mut total_sq = 0f64;
        let mut grads = Vec::new();
        for (_, var) in vs.variables() {
            let grad = var.grad();
            if grad.defined() {
                let norm = grad.norm().double_value(&[]);
                total_sq += norm * norm;
                grads.push(grad);
            }
        }
        let total = total_sq.sqrt();
        let scale = max_norm / (total + 1e-6);
        if scale < 1.0 {
            for grad in grads.iter_mut() {
                let scaled = &*grad * scale;
                grad.copy_(&scaled);
            }
        }
    });
}

/// Serializable snapshot of an [`LrScheduler`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SchedulerState {
    /// Number of applied scheduler steps.
    pub n_updates: i64,
}

/// Linear decay of the learning rate over the configured total environment
/// steps, stepped once per optimizer update.
pub struct LrScheduler {
    base_lr: f64,
    steps_per_update: i64,
    total_steps: i64,
    n_updates: i64,
}

impl LrScheduler {
    /// Creates a scheduler decaying `base_lr` to zero over `total_steps`
    /// environment steps, where each update covers `steps_per_update` of
    /// them.
    pub fn new(base_lr: f64, steps_per_update: i64, total_steps: i64) -> Self {
        Self {
            base_lr,
            steps_per_update,
            total_steps,
            n_updates: 0,
        }
    }

    /// The learning rate after `n_updates` updates.
    pub fn lr(&self) -> f64 {
        let progressed = (self.n_updates * self.steps_per_update).min(self.total_steps);
        self.base_lr * (1.0 - progressed as f64 / self.total_steps as f64)
    }

    /// Advances the schedule and applies the new rate to `opt`.
    pub fn step(&mut self, opt: &mut Optimizer) {
        self.n_updates += 1;
        opt.set_lr(self.lr());
    }

    /// Exports the scheduler state for checkpointing.
    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            n_updates: self.n_updates,
        }
    }

    /// Restores the scheduler state from a checkpoint.
    pub fn load_state(&mut self, state: &SchedulerState) {
        self.n_updates = state.n_updates;
    }
}
