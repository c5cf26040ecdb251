//! Smoke-training entry point.
//!
//! Runs the full training core against the in-process synthetic actor
//! driver. The production setup replaces the driver with the external actor
//! pool and the synthetic dataset with a real one.
use anyhow::Result;
use atelier_core::record::JsonlRecorder;
use atelier_tch::data::{DataLoader, TensorDataLoader};
use atelier_tch::driver::run_synthetic_driver;
use atelier_tch::{TrainConfig, Trainer};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use tch::Tensor;

/// Trains the painting policy against the adversarial reward.
#[derive(Parser, Debug)]
struct Args {
    /// Path to a YAML training configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to a saved image tensor `[N, C, H, W]` used as real data.
    /// Without it, a synthetic noise dataset is used.
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// Experiment id override.
    #[arg(long)]
    xpid: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TrainConfig::load(path)?,
        None => TrainConfig::default(),
    };
    if args.xpid.is_some() {
        config.xpid = args.xpid;
    }

    let loader: Box<dyn DataLoader + Send> = match &args.dataset {
        Some(path) => {
            let images = Tensor::load(path)?;
            let n = images.size()[0];
            let labels = Tensor::zeros([n], (tch::Kind::Float, tch::Device::Cpu));
            Box::new(TensorDataLoader::new(images, labels, config.batch_size as i64))
        }
        None => Box::new(TensorDataLoader::synthetic(
            config.obs_shape,
            (config.batch_size * 8) as i64,
            config.batch_size as i64,
        )),
    };

    let mut trainer = Trainer::build(config.clone())?;
    info!("Experiment {}", trainer.xpid());
    let recorder = JsonlRecorder::new(trainer.stats_log_path())?;

    let driver_config = config;
    let stats = trainer.train(
        move |handles| run_synthetic_driver(handles, driver_config),
        loader,
        Box::new(recorder),
    )?;
    info!("Final stats: ({})", stats.summary());
    Ok(())
}
