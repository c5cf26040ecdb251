//! The policy-learner loop.
//!
//! All learner threads share one [`PolicyLearnerCore`] through a mutex: the
//! mutex both serializes the update stream and owns the mutable state it
//! protects, so the training model, optimizer, scheduler and recorder can
//! only ever be touched by the thread currently holding the lock. Behavior
//! and target logits of one iteration always come from the same model
//! version.
use crate::batch::{EnvOutput, TrajectoryBatch};
use crate::checkpoint::{load_weights, weights_of, TensorData};
use crate::config::TrainConfig;
use crate::loss;
use crate::net::{Discriminator, PolicyNet};
use crate::opt::{clip_grad_norm, LrScheduler, Optimizer, OptimizerConfig, OptimizerState, SchedulerState};
use crate::publish::WeightStore;
use crate::vtrace;
use anyhow::Result;
use atelier_core::{BatchingQueue, Recorder, SharedStats, StatValue};
use std::{
    collections::HashMap,
    convert::TryFrom,
    sync::{Arc, Mutex},
};
use tch::{nn::VarStore, no_grad, Device, Kind, Reduction, Tensor};

/// Applies the adversarial reward transform to `reward` in place.
///
/// With temporal credit assignment, every canvas of the unroll is scored and
/// the correction is the shaped difference of consecutive scores, with the
/// unroll-final canvas score spliced in at episode boundaries before
/// differencing. Without it, only boundary timesteps receive the shaped
/// score of the final canvas. Returns the applied correction when any
/// shaping ran; otherwise the reward channel is left untouched.
fn apply_reward_shaping(
    disc: &Discriminator,
    canvas: &Tensor,
    reward: &mut Tensor,
    done: &Tensor,
    final_canvas: &Tensor,
    use_tca: bool,
) -> Option<Tensor> {
    no_grad(|| {
        let size = canvas.size();
        let (t1, b) = (size[0], size[1]);
        let boundary = done.narrow(0, 1, t1 - 1).nonzero();
        let n = boundary.size()[0];

        if use_tca {
            let flat = canvas.view([-1, size[2], size[3], size[4]]);
            let p = if n > 0 {
                let idx_t = boundary.select(1, 0) + 1;
                let idx_b = boundary.select(1, 1);
                let finals = final_canvas.get(0).index_select(0, &idx_b);
                let scores = disc.forward(&Tensor::cat(&[flat, finals], 0), false);
                let total = scores.size()[0];
                let mut p = scores.narrow(0, 0, total - n).view([t1, b]);
                let _ = p.index_put_(
                    &[Some(&idx_t), Some(&idx_b)],
                    &scores.narrow(0, total - n, n),
                    false,
                );
                p
            } else {
                disc.forward(&flat, false).view([t1, b])
            };
            let r = loss::shaped_reward(&(p.narrow(0, 1, t1 - 1) - p.narrow(0, 0, t1 - 1)));
            let mut tail = reward.narrow(0, 1, t1 - 1);
            tail += &r;
            Some(r)
        } else if n > 0 {
            let idx_t = boundary.select(1, 0) + 1;
            let idx_b = boundary.select(1, 1);
            let finals = final_canvas.get(0).index_select(0, &idx_b);
            let r = loss::shaped_reward(&disc.forward(&finals, false));
            let _ = reward.index_put_(&[Some(&idx_t), Some(&idx_b)], &r, true);
            Some(r)
        } else {
            None
        }
    })
}

/// State exclusively owned by the policy-learner mutex.
pub struct PolicyLearnerCore {
    config: TrainConfig,
    device: Device,
    vs: VarStore,
    model: PolicyNet,
    opt: Optimizer,
    sched: LrScheduler,
    disc_vs: VarStore,
    disc: Discriminator,
    disc_version: u64,
    stats: SharedStats,
    recorder: Box<dyn Recorder + Send>,
}

impl PolicyLearnerCore {
    /// Builds the training model, optimizer, scheduler and the discriminator
    /// eval copy on `device`.
    pub fn new(
        device: Device,
        config: TrainConfig,
        stats: SharedStats,
        recorder: Box<dyn Recorder + Send>,
    ) -> Self {
        let vs = VarStore::new(device);
        let model = PolicyNet::new(&vs, &config.policy_net_config());
        let opt = OptimizerConfig::adam(config.policy_learning_rate).build();
        let sched = LrScheduler::new(
            config.policy_learning_rate,
            (config.unroll_length * config.batch_size) as i64,
            config.total_steps as i64,
        );
        let disc_vs = VarStore::new(device);
        let disc = Discriminator::new(&disc_vs, &config.discriminator_config());

        Self {
            config,
            device,
            vs,
            model,
            opt,
            sched,
            disc_vs,
            disc,
            disc_version: 0,
            stats,
            recorder,
        }
    }

    /// A weight store seeded with the current training weights.
    pub fn weight_store(&self) -> WeightStore {
        WeightStore::new(&self.vs)
    }

    /// Pulls the newest published discriminator weights when the eval copy
    /// is stale.
    pub fn refresh_discriminator(&mut self, store: &WeightStore) {
        store.sync(&mut self.disc_version, &mut self.disc_vs);
    }

    /// Exports the persisted parts for a checkpoint record.
    pub fn capture(&self) -> (HashMap<String, TensorData>, OptimizerState, SchedulerState) {
        (weights_of(&self.vs), self.opt.state(), self.sched.state())
    }

    /// Restores the persisted parts from a checkpoint record.
    pub fn restore(
        &mut self,
        weights: &HashMap<String, TensorData>,
        opt: &OptimizerState,
        sched: &SchedulerState,
    ) -> Result<()> {
        load_weights(weights, &mut self.vs)?;
        self.opt.load_state(opt, &self.vs);
        self.sched.load_state(sched);
        Ok(())
    }

    /// One optimization step over a learner batch.
    pub fn step(
        &mut self,
        batch: TrajectoryBatch,
        queue_len: usize,
        policy_store: &WeightStore,
        disc_store: &WeightStore,
    ) -> Result<()> {
        let batch = batch.to_device(self.device);
        let TrajectoryBatch {
            env,
            agent: behavior,
            initial_state,
            final_canvas,
        } = batch;
        let EnvOutput {
            canvas,
            reward,
            done,
            episode_step: _,
            episode_return,
        } = env;
        let mut reward = reward;

        self.refresh_discriminator(disc_store);
        let shaped = apply_reward_shaping(
            &self.disc,
            &canvas,
            &mut reward,
            &done,
            &final_canvas,
            self.config.use_tca,
        );

        let t1 = canvas.size()[0];
        let tm = t1 - 1;
        let b = canvas.size()[1];

        self.opt.zero_grad(&self.vs);
        let (learner_out, _) = self.model.forward(&canvas, &done, &initial_state);

        // Final value estimate, used for bootstrapping.
        let bootstrap_value = learner_out.baseline.get(tm);

        // Move from obs[t] -> action[t] to action[t] -> obs[t].
        let behavior = behavior.narrow_time(1, tm);
        let reward = reward.narrow(0, 1, tm);
        let done = done.narrow(0, 1, tm);
        let episode_return = episode_return.narrow(0, 1, tm);
        let learner_out = learner_out.narrow_time(0, tm);

        let discounts = done.logical_not().to_kind(Kind::Float) * self.config.discounting;

        let returns = vtrace::from_logits(
            &behavior.policy_logits,
            &learner_out.policy_logits,
            &behavior.action,
            &discounts,
            &reward,
            &learner_out.baseline,
            &bootstrap_value,
            1.0,
            1.0,
        );

        let pg_loss = loss::policy_gradient_loss(
            &learner_out.policy_logits,
            &behavior.action,
            &returns.pg_advantages,
        );
        let baseline_loss =
            loss::baseline_loss(&(&returns.vs - &learner_out.baseline)) * self.config.baseline_cost;
        let entropy_loss =
            loss::entropy_loss(&learner_out.policy_logits) * self.config.entropy_cost;
        let total_loss = &pg_loss + &baseline_loss + &entropy_loss;

        total_loss.backward();
        clip_grad_norm(&self.vs, self.config.grad_norm_clipping);
        self.opt.step(&self.vs);
        self.sched.step(&mut self.opt);

        policy_store.publish(&self.vs);

        let episode_returns = Vec::<f32>::try_from(&episode_return.masked_select(&done))?;
        let mut stats = self.stats.lock();
        stats.add_int("step", tm * b);
        if episode_returns.is_empty() {
            stats.remove("mean_episode_return");
        } else {
            let mean = episode_returns.iter().sum::<f32>() / episode_returns.len() as f32;
            stats.insert("mean_episode_return", StatValue::Scalar(mean));
        }
        stats.insert("episode_returns", StatValue::Array1(episode_returns));
        match &shaped {
            Some(r) => stats.insert(
                "mean_discriminator_reward",
                StatValue::Scalar(r.mean(Kind::Float).double_value(&[]) as f32),
            ),
            None => stats.remove("mean_discriminator_reward"),
        }
        stats.insert(
            "total_loss",
            StatValue::Scalar(total_loss.double_value(&[]) as f32),
        );
        stats.insert(
            "pg_loss",
            StatValue::Scalar(pg_loss.double_value(&[]) as f32),
        );
        stats.insert(
            "baseline_loss",
            StatValue::Scalar(baseline_loss.double_value(&[]) as f32),
        );
        stats.insert(
            "entropy_loss",
            StatValue::Scalar(entropy_loss.double_value(&[]) as f32),
        );
        stats.insert("learner_queue_size", StatValue::Int(queue_len as i64));

        if self.config.condition {
            // Distance between the painted and the target half of the final
            // renders that completed an episode in this batch.
            let boundary = done.nonzero();
            if boundary.size()[0] > 0 {
                let finals = final_canvas.get(0).index_select(0, &boundary.select(1, 1));
                let channels = finals.size()[1];
                let halves = finals.split(channels / 2, 1);
                let l2 = halves[0].mse_loss(&halves[1], Reduction::Mean);
                stats.insert(
                    "l2_loss",
                    StatValue::Scalar(l2.double_value(&[]) as f32),
                );
            }
        }

        self.recorder.write(&stats)?;
        Ok(())
    }
}

/// Drains the learner queue until it is closed.
///
/// Multiple instances of this loop share `core`; the mutex makes their
/// iterations a single logical stream of updates.
pub fn run_policy_learner(
    queue: BatchingQueue<TrajectoryBatch>,
    core: Arc<Mutex<PolicyLearnerCore>>,
    policy_store: Arc<WeightStore>,
    disc_store: Arc<WeightStore>,
) -> Result<()> {
    while let Some(batch) = queue.next_batch() {
        let mut core = core.lock().unwrap();
        core.step(batch, queue.len(), &policy_store, &disc_store)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::DiscriminatorConfig;

    fn disc() -> (VarStore, Discriminator) {
        let vs = VarStore::new(Device::Cpu);
        let disc = Discriminator::new(
            &vs,
            &DiscriminatorConfig {
                obs_shape: (1, 16, 16),
            },
        );
        (vs, disc)
    }

    fn rollout(t1: i64, b: i64, done_at_end: bool) -> (Tensor, Tensor, Tensor, Tensor) {
        let canvas = Tensor::rand([t1, b, 1, 16, 16], (Kind::Float, Device::Cpu));
        let reward = Tensor::rand([t1, b], (Kind::Float, Device::Cpu));
        let mut done = Tensor::zeros([t1, b], (Kind::Float, Device::Cpu));
        if done_at_end {
            let _ = done.get(t1 - 1).fill_(1.0);
        }
        let final_canvas = Tensor::rand([1, b, 1, 16, 16], (Kind::Float, Device::Cpu));
        (canvas, reward, done.to_kind(Kind::Bool), final_canvas)
    }

    #[test]
    fn rewards_pass_through_unmodified_without_tca_or_boundary() {
        tch::manual_seed(0);
        let (_vs, disc) = disc();
        let (canvas, reward, done, final_canvas) = rollout(4, 2, false);
        let mut shaped_reward = reward.copy();
        let shaped = apply_reward_shaping(&disc, &canvas, &mut shaped_reward, &done, &final_canvas, false);
        assert!(shaped.is_none());
        assert_eq!(reward.eq_tensor(&shaped_reward).all().int64_value(&[]), 1);
    }

    #[test]
    fn boundary_reward_lands_on_the_boundary_timestep() {
        tch::manual_seed(0);
        let (_vs, disc) = disc();
        let (canvas, reward, done, final_canvas) = rollout(4, 2, true);
        let before = reward.copy();
        let mut reward = reward;
        let shaped = apply_reward_shaping(&disc, &canvas, &mut reward, &done, &final_canvas, false);
        assert!(shaped.is_some());
        // Only the final timestep changed.
        let head = reward.narrow(0, 0, 3);
        let head_before = before.narrow(0, 0, 3);
        assert_eq!(head.eq_tensor(&head_before).all().int64_value(&[]), 1);
        assert_eq!(reward.get(3).eq_tensor(&before.get(3)).all().int64_value(&[]), 0);
    }

    #[test]
    fn tca_corrects_every_timestep_after_the_first() {
        tch::manual_seed(0);
        let (_vs, disc) = disc();
        let (canvas, reward, done, final_canvas) = rollout(4, 2, true);
        let before = reward.copy();
        let mut reward = reward;
        let shaped = apply_reward_shaping(&disc, &canvas, &mut reward, &done, &final_canvas, true);
        let r = shaped.unwrap();
        assert_eq!(r.size(), vec![3, 2]);
        // Timestep zero has no previous score and stays untouched.
        assert_eq!(reward.get(0).eq_tensor(&before.get(0)).all().int64_value(&[]), 1);
    }
}
