//! Discriminator-learner loop over a synthetic replay feed.
use atelier_core::{BatchingQueue, BatchingQueueConfig, FrameBuffer, SharedStats, StatValue};
use atelier_tch::batch::CanvasBatch;
use atelier_tch::data::TensorDataLoader;
use atelier_tch::discriminator::{run_discriminator_learner, DiscriminatorLearnerCore};
use atelier_tch::TrainConfig;
use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};
use tch::{Device, Kind, Tensor};

fn scalar(stats: &SharedStats, key: &str) -> Option<f32> {
    match stats.lock().get(key) {
        Some(StatValue::Scalar(v)) => Some(*v),
        _ => None,
    }
}

#[test]
fn branch_losses_stay_finite_and_confidences_are_probabilities() {
    let _ = env_logger::builder().is_test(true).try_init();
    tch::manual_seed(7);
    let config = TrainConfig {
        batch_size: 4,
        obs_shape: (1, 16, 16),
        replay_stall_timeout_secs: 30,
        ..Default::default()
    };

    let stats = SharedStats::new();
    let core = Arc::new(Mutex::new(DiscriminatorLearnerCore::new(
        Device::Cpu,
        config.clone(),
        stats.clone(),
    )));
    let store = Arc::new(core.lock().unwrap().weight_store());
    let buffer = FrameBuffer::new(16, 7);
    let loader = Box::new(TensorDataLoader::synthetic(config.obs_shape, 16, 4));

    let (sender, queue) = BatchingQueue::<CanvasBatch>::new(BatchingQueueConfig::dynamic(
        1,
        2,
        Duration::from_millis(10),
        8,
    ));

    let worker = {
        let core = core.clone();
        thread::spawn(move || run_discriminator_learner(core, loader, queue, buffer, store))
    };

    // Feed terminal canvases until a few training iterations went through.
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let canvases = CanvasBatch(Tensor::rand([1, 2, 1, 16, 16], (Kind::Float, Device::Cpu)));
        if sender.send(canvases).is_err() {
            break;
        }
        if scalar(&stats, "d_loss").is_some() && scalar(&stats, "fake_confidence").is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "no discriminator update happened");
    }
    sender.close();
    worker.join().unwrap().unwrap();

    for key in &["d_loss", "real_loss", "fake_loss"] {
        let value = scalar(&stats, key).unwrap();
        assert!(value.is_finite(), "{} is not finite", key);
    }
    for key in &["real_confidence", "fake_confidence"] {
        let value = scalar(&stats, key).unwrap();
        assert!((0.0..=1.0).contains(&value), "{} out of range", key);
    }
}
