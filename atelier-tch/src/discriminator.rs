//! The discriminator-learner loop.
//!
//! Exactly one instance of this loop runs; its state still lives behind a
//! mutex so the monitor can capture a consistent snapshot for checkpoints
//! while the loop is mid-iteration. The replay buffer is only ever touched
//! from this loop.
use crate::batch::CanvasBatch;
use crate::checkpoint::{load_weights, weights_of, TensorData};
use crate::config::TrainConfig;
use crate::data::DataLoader;
use crate::net::Discriminator;
use crate::opt::{clip_grad_norm, LrScheduler, Optimizer, OptimizerConfig, OptimizerState, SchedulerState};
use crate::publish::WeightStore;
use anyhow::{Context, Result};
use atelier_core::{BatchingQueue, FrameBuffer, SharedStats, StatValue};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tch::{nn::VarStore, Device, Kind, Reduction, Tensor};

const REAL_LABEL: f64 = 1.0;
const FAKE_LABEL: f64 = 0.0;

/// State owned by the discriminator-learner mutex.
pub struct DiscriminatorLearnerCore {
    config: TrainConfig,
    device: Device,
    vs: VarStore,
    disc: Discriminator,
    opt: Optimizer,
    sched: LrScheduler,
    stats: SharedStats,
}

impl DiscriminatorLearnerCore {
    /// Builds the training discriminator, optimizer and scheduler on
    /// `device`.
    pub fn new(device: Device, config: TrainConfig, stats: SharedStats) -> Self {
        let vs = VarStore::new(device);
        let disc = Discriminator::new(&vs, &config.discriminator_config());
        let opt = OptimizerConfig::adam_gan(config.discriminator_learning_rate).build();
        let sched = LrScheduler::new(
            config.discriminator_learning_rate,
            (config.unroll_length * config.batch_size) as i64,
            config.total_steps as i64,
        );
        Self {
            config,
            device,
            vs,
            disc,
            opt,
            sched,
            stats,
        }
    }

    /// A weight store seeded with the current training weights.
    pub fn weight_store(&self) -> WeightStore {
        WeightStore::new(&self.vs)
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
}

/// Splits a pulled terminal-canvas batch into single frames and pushes them.
fn push_frames(buffer: &mut FrameBuffer<Tensor>, batch: CanvasBatch) {
    let canvases = batch.0.get(0);
    let frames = canvases
        .split(1, 0)
        .into_iter()
        .map(|f| f.squeeze_dim(0))
        .collect();
    buffer.push(frames);
}

/// Runs GAN training steps over the real-data loader until the replay feed
/// is closed.
///
/// Each iteration trains the real branch on one loader batch and the fake
/// branch on a buffer sample, applies a single optimizer step over both
/// branches' accumulated gradients, and publishes the updated weights for
/// the policy learner's eval copy. The loader is restarted at the end of
/// every pass; the loop never terminates on its own. A replay feed that
/// stays silent beyond the configured stall bound is a reported error.
pub fn run_discriminator_learner(
    core: Arc<Mutex<DiscriminatorLearnerCore>>,
    mut loader: Box<dyn DataLoader + Send>,
    replay_queue: BatchingQueue<CanvasBatch>,
    mut buffer: FrameBuffer<Tensor>,
    store: Arc<WeightStore>,
) -> Result<()> {
    let (batch_size, condition, clip, stall) = {
        let core = core.lock().unwrap();
        (
            core.config.batch_size,
            core.config.condition,
            core.config.grad_norm_clipping,
            Duration::from_secs(core.config.replay_stall_timeout_secs),
        )
    };

    loop {
        while let Some((real, _)) = loader.next_batch() {
            let (real_loss, real_confidence) = {
                let mut core = core.lock().unwrap();
                let core = &mut *core;
                let real = real.to_device(core.device);
                let real = if condition {
                    // The conditioned discriminator scores (canvas, target)
                    // pairs; real samples stand in for both halves.
                    real.repeat([1, 2, 1, 1])
                } else {
                    real
                };
                core.opt.zero_grad(&core.vs);
                let p_real = core.disc.forward(&real, true);
                let label = Tensor::full(
                    &[p_real.size()[0]],
                    REAL_LABEL,
                    (Kind::Float, core.device),
                );
                let real_loss = p_real.binary_cross_entropy_with_logits::<Tensor>(
                    &label,
                    None,
                    None,
                    Reduction::Mean,
                );
                real_loss.backward();
                clip_grad_norm(&core.vs, clip);
                let confidence =
                    p_real.sigmoid().mean(Kind::Float).double_value(&[]) as f32;
                (real_loss.double_value(&[]) as f32, confidence)
            };

            // Blocking fill: always consume at least one freshly produced
            // batch, then keep pulling until one training batch is stored.
            // Runs outside the lock so checkpoints are never held up by a
            // slow feed.
            loop {
                match replay_queue.next_batch_within(stall) {
                    Ok(Some(batch)) => push_frames(&mut buffer, batch),
                    Ok(None) => return Ok(()),
                    Err(err) => {
                        return Err(err).context("replay feed stalled while filling the buffer")
                    }
                }
                if buffer.len() >= batch_size {
                    break;
                }
            }

            let mut core = core.lock().unwrap();
            let core = &mut *core;
            let fake = Tensor::stack(&buffer.sample(batch_size)?, 0).to_device(core.device);
            let p_fake = core.disc.forward(&fake, true);
            let label = Tensor::full(
                &[p_fake.size()[0]],
                FAKE_LABEL,
                (Kind::Float, core.device),
            );
            let fake_loss = p_fake.binary_cross_entropy_with_logits::<Tensor>(
                &label,
                None,
                None,
                Reduction::Mean,
            );
            fake_loss.backward();
            let fake_confidence = p_fake.sigmoid().mean(Kind::Float).double_value(&[]) as f32;
            clip_grad_norm(&core.vs, clip);

            core.opt.step(&core.vs);
            core.sched.step(&mut core.opt);
            store.publish(&core.vs);

            let fake_loss = fake_loss.double_value(&[]) as f32;
            let mut stats = core.stats.lock();
            stats.insert("d_loss", StatValue::Scalar(real_loss + fake_loss));
            stats.insert("real_loss", StatValue::Scalar(real_loss));
            stats.insert("fake_loss", StatValue::Scalar(fake_loss));
            stats.insert("real_confidence", StatValue::Scalar(real_confidence));
            stats.insert("fake_confidence", StatValue::Scalar(fake_confidence));
        }
        loader.reset();
    }
}
