//! Orchestration of the concurrent training loops.
//!
//! One [`Trainer`] wires the queues, spawns the actor driver, the inference
//! servers, the policy learners and the discriminator learner, then runs the
//! monitor loop on the calling thread until the step target is reached, a
//! stop is requested, or a supervised thread reports a failure.
use crate::batch::{CanvasBatch, TrajectoryBatch};
use crate::checkpoint::Checkpoint;
use crate::config::TrainConfig;
use crate::data::DataLoader;
use crate::discriminator::{run_discriminator_learner, DiscriminatorLearnerCore};
use crate::inference::{run_inference, InferenceBatcher, InferenceRequester, ServingModel};
use crate::learner::{run_policy_learner, PolicyLearnerCore};
use crate::publish::WeightStore;
use anyhow::{Context, Result};
use atelier_core::{
    BatchingQueue, BatchingQueueConfig, DynamicBatcher, QueueSender, Recorder, SharedStats, Stats,
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{error, info};
use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tch::Device;

/// Everything the external actor driver needs to feed the training core.
pub struct ActorHandles {
    /// Producer half of the learner queue.
    pub learner: QueueSender<TrajectoryBatch>,

    /// Producer half of the replay queue.
    pub replay: QueueSender<CanvasBatch>,

    /// Request side of the inference batcher.
    pub inference: InferenceRequester,

    /// Recurrent state handed to every fresh actor.
    pub initial_state: tch::Tensor,
}

struct ThreadOutcome {
    name: String,
    result: Result<()>,
}

fn spawn_supervised<F>(
    name: &str,
    outcomes: &Sender<ThreadOutcome>,
    f: F,
) -> JoinHandle<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let name = name.to_string();
    let outcomes = outcomes.clone();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let result = f();
            if let Err(err) = &result {
                error!("Exception in {} thread: {:?}", name, err);
            }
            let _ = outcomes.send(ThreadOutcome { name, result });
        })
        .expect("spawning thread")
}

/// Orchestrates one training run.
pub struct Trainer {
    config: TrainConfig,
    xpid: String,
    stop: Arc<AtomicBool>,
}

impl Trainer {
    /// Validates the configuration and prepares the run directory.
    pub fn build(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let xpid = config.resolve_xpid();
        let run_dir = config
            .checkpoint_path(&xpid)
            .parent()
            .expect("checkpoint path has a parent")
            .to_path_buf();
        fs::create_dir_all(&run_dir).with_context(|| format!("creating {:?}", run_dir))?;
        Ok(Self {
            config,
            xpid,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The resolved experiment id.
    pub fn xpid(&self) -> &str {
        &self.xpid
    }

    /// Where this run's checkpoint record lives.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.config.checkpoint_path(&self.xpid)
    }

    /// Where this run's stats log lives.
    pub fn stats_log_path(&self) -> PathBuf {
        self.config.stats_log_path(&self.xpid)
    }

    /// Flag observed by the monitor loop; setting it requests a graceful
    /// shutdown with a final checkpoint.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Runs training to completion and returns the final stats.
    ///
    /// `driver` is spawned on its own thread with the queue handles; it runs
    /// until the queues it uses are closed. `loader` feeds the discriminator
    /// real data; `recorder` persists the stats snapshot of every policy
    /// update.
    pub fn train<F>(
        &mut self,
        driver: F,
        loader: Box<dyn DataLoader + Send>,
        recorder: Box<dyn Recorder + Send>,
    ) -> Result<Stats>
    where
        F: FnOnce(ActorHandles) -> Result<()> + Send + 'static,
    {
        let config = &self.config;
        tch::manual_seed(config.seed as i64);

        let device = if !config.disable_cuda && tch::Cuda::is_available() {
            info!("Using CUDA.");
            Device::Cuda(0)
        } else {
            info!("Not using CUDA.");
            Device::Cpu
        };

        // Queues. The learner queue has a static batch size; the replay and
        // inference queues release partial batches after a bounded wait.
        let queue_timeout = Duration::from_millis(config.queue_timeout_ms);
        let (learner_sender, learner_queue) = BatchingQueue::<TrajectoryBatch>::new(
            BatchingQueueConfig::static_size(1, config.batch_size, config.learner_queue_bound()),
        );
        let (replay_sender, replay_queue) = BatchingQueue::<CanvasBatch>::new(
            BatchingQueueConfig::dynamic(1, config.num_actors, queue_timeout, config.num_actors),
        );
        let (inference_client, inference_batcher): (InferenceRequester, InferenceBatcher) =
            DynamicBatcher::new(BatchingQueueConfig::dynamic(1, 512, queue_timeout, 1024));

        let buffer = atelier_core::FrameBuffer::new(config.replay_capacity(), config.seed);

        let stats = SharedStats::new();

        // Training copies, owned by their learner mutexes.
        let policy_core = Arc::new(Mutex::new(PolicyLearnerCore::new(
            device,
            config.clone(),
            stats.clone(),
            recorder,
        )));
        let disc_core = Arc::new(Mutex::new(DiscriminatorLearnerCore::new(
            device,
            config.clone(),
            stats.clone(),
        )));

        // Load state from a checkpoint, if possible.
        let checkpoint_path = self.checkpoint_path();
        if checkpoint_path.exists() {
            let checkpoint = Checkpoint::load(&checkpoint_path)?;
            policy_core.lock().unwrap().restore(
                &checkpoint.model,
                &checkpoint.optimizer,
                &checkpoint.scheduler,
            )?;
            disc_core.lock().unwrap().restore(
                &checkpoint.discriminator,
                &checkpoint.d_optimizer,
                &checkpoint.d_scheduler,
            )?;
            stats.replace(checkpoint.stats);
            info!(
                "Resuming preempted run, current stats: {}",
                stats.lock().summary()
            );
        }

        // Publish the just-established training copies; the serving and eval
        // copies synchronize from these snapshots before any loop starts.
        let policy_store = Arc::new(policy_core.lock().unwrap().weight_store());
        let disc_store = Arc::new(disc_core.lock().unwrap().weight_store());
        let serving = {
            let mut serving = ServingModel::new(device, &config.policy_net_config());
            serving.refresh(&policy_store);
            Arc::new(Mutex::new(serving))
        };
        policy_core
            .lock()
            .unwrap()
            .refresh_discriminator(&disc_store);

        // The driver-side protocol is host memory; transfers to the compute
        // devices happen inside the serving and learner loops.
        let initial_state = serving.lock().unwrap().initial_state().to_device(Device::Cpu);

        let (outcomes_s, outcomes_r): (Sender<ThreadOutcome>, Receiver<ThreadOutcome>) =
            unbounded();

        // Actor driver.
        let handles = ActorHandles {
            learner: learner_sender.clone(),
            replay: replay_sender.clone(),
            inference: inference_client.clone(),
            initial_state,
        };
        let mut threads = vec![spawn_supervised("actor-driver", &outcomes_s, move || {
            driver(handles)
        })];

        // Inference servers.
        for i in 0..config.num_inference_threads {
            let batcher = inference_batcher.clone();
            let serving = serving.clone();
            let store = policy_store.clone();
            threads.push(spawn_supervised(
                &format!("inference-{}", i),
                &outcomes_s,
                move || {
                    run_inference(&batcher, &serving, &store);
                    Ok(())
                },
            ));
        }

        // Policy learners, sharing one core.
        for i in 0..config.num_learner_threads {
            let queue = learner_queue.clone();
            let core = policy_core.clone();
            let policy_store = policy_store.clone();
            let disc_store = disc_store.clone();
            threads.push(spawn_supervised(
                &format!("learner-{}", i),
                &outcomes_s,
                move || run_policy_learner(queue, core, policy_store, disc_store),
            ));
        }

        // Discriminator learner; detached, allowed to die with the process.
        {
            let core = disc_core.clone();
            let store = disc_store.clone();
            let queue = replay_queue;
            spawn_supervised("d-learner", &outcomes_s, move || {
                run_discriminator_learner(core, loader, queue, buffer, store)
            });
        }

        // Monitor loop.
        let poll = Duration::from_millis(config.poll_interval_ms);
        let checkpoint_interval = Duration::from_secs(config.checkpoint_interval_secs);
        let mut last_checkpoint = Instant::now();
        loop {
            let start = Instant::now();
            let start_step = stats.lock().int("step");
            if start_step >= config.total_steps as i64 {
                info!("Learning finished after {} steps.", start_step);
                break;
            }
            if self.stop.load(Ordering::Relaxed) {
                info!("Stop requested, shutting down.");
                break;
            }

            match outcomes_r.recv_timeout(poll) {
                Ok(outcome) => match outcome.result {
                    Ok(()) => info!("Thread {} finished.", outcome.name),
                    Err(_) => {
                        error!(
                            "Thread {} failed, shutting down all loops.",
                            outcome.name
                        );
                        break;
                    }
                },
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }

            if last_checkpoint.elapsed() >= checkpoint_interval {
                self.write_checkpoint(&policy_core, &disc_core, &stats)?;
                last_checkpoint = Instant::now();
            }

            let end_step = stats.lock().int("step");
            let sps = (end_step - start_step) as f64 / start.elapsed().as_secs_f64();
            info!(
                "Step {} @ {:.1} SPS. Inference batcher size: {}. Learner queue size: {}. Other stats: ({})",
                end_step,
                sps,
                inference_batcher.len(),
                learner_sender.len(),
                stats.lock().summary()
            );
        }

        // Done with learning; write the final record and stop all the
        // ongoing work.
        self.write_checkpoint(&policy_core, &disc_core, &stats)?;

        inference_client.close();
        learner_sender.close();
        replay_sender.close();

        for handle in threads {
            if handle.join().is_err() {
                error!("A worker thread panicked during shutdown.");
            }
        }

        Ok(stats.snapshot())
    }

    fn write_checkpoint(
        &self,
        policy_core: &Arc<Mutex<PolicyLearnerCore>>,
        disc_core: &Arc<Mutex<DiscriminatorLearnerCore>>,
        stats: &SharedStats,
    ) -> Result<()> {
        if self.config.disable_checkpoint {
            return Ok(());
        }
        let (model, optimizer, scheduler) = policy_core.lock().unwrap().capture();
        let (discriminator, d_optimizer, d_scheduler) = disc_core.lock().unwrap().capture();
        let checkpoint = Checkpoint {
            model,
            discriminator,
            optimizer,
            d_optimizer,
            scheduler,
            d_scheduler,
            stats: stats.snapshot(),
            config: self.config.clone(),
        };
        checkpoint.save(self.checkpoint_path())
    }
}
