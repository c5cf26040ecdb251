//! End-to-end training run with the synthetic actor driver.
use atelier_core::record::NullRecorder;
use atelier_tch::checkpoint::Checkpoint;
use atelier_tch::data::TensorDataLoader;
use atelier_tch::driver::run_synthetic_driver;
use atelier_tch::{TrainConfig, Trainer};
use crossbeam_channel::bounded;
use std::{thread, time::Duration};
use tempdir::TempDir;

fn test_config(savedir: &str) -> TrainConfig {
    TrainConfig {
        xpid: Some("e2e".to_string()),
        savedir: savedir.to_string(),
        num_actors: 2,
        total_steps: 40,
        batch_size: 4,
        unroll_length: 5,
        num_learner_threads: 2,
        num_inference_threads: 2,
        disable_cuda: true,
        obs_shape: (1, 16, 16),
        action_dims: vec![4, 4],
        hidden_dim: 16,
        queue_timeout_ms: 5,
        poll_interval_ms: 50,
        // Far beyond the run length: only the final record is written.
        checkpoint_interval_secs: 3600,
        replay_stall_timeout_secs: 30,
        ..Default::default()
    }
}

fn run_to_completion(config: TrainConfig) -> atelier_core::Stats {
    let loader = Box::new(TensorDataLoader::synthetic(config.obs_shape, 32, 4));
    let mut trainer = Trainer::build(config.clone()).unwrap();
    let driver_config = config;

    // The whole run, including shutdown, must finish in bounded time: all
    // learner and inference threads join once the queues are closed.
    let (done_s, done_r) = bounded(1);
    thread::spawn(move || {
        let result = trainer.train(
            move |handles| run_synthetic_driver(handles, driver_config),
            loader,
            Box::new(NullRecorder),
        );
        done_s.send(result).unwrap();
    });
    done_r
        .recv_timeout(Duration::from_secs(120))
        .expect("training and shutdown finished in bounded time")
        .expect("training ran without error")
}

#[test]
fn trains_to_the_step_target_and_persists_one_full_record() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new("atelier-e2e").unwrap();
    let savedir = dir.path().to_str().unwrap().to_string();
    let config = test_config(&savedir);

    let stats = run_to_completion(config.clone());
    assert!(stats.int("step") >= 40);
    assert!(stats.get("total_loss").is_some());

    let checkpoint_path = dir.path().join("e2e").join("checkpoint.bin");
    assert!(checkpoint_path.exists());
    assert!(!dir.path().join("e2e").join("checkpoint.tmp").exists());

    // All persisted components are present in the record.
    let record = Checkpoint::load(&checkpoint_path).unwrap();
    assert!(!record.model.is_empty());
    assert!(!record.discriminator.is_empty());
    assert!(record.optimizer.t >= 1);
    assert!(record.scheduler.n_updates >= 1);
    assert!(record.stats.int("step") >= 40);
    assert_eq!(record.config.batch_size, 4);

    // A second run restores the record and, with the step target already
    // met, shuts down cleanly right away.
    let stats = run_to_completion(config);
    assert!(stats.int("step") >= 40);
}
