#![warn(missing_docs)]
//! Backend-free primitives for the atelier training core.
//!
//! This crate holds the concurrency and bookkeeping building blocks that do
//! not depend on a tensor backend:
//!
//! * [`BatchingQueue`] / [`QueueSender`] — closable blocking queues that
//!   group incoming items into batches with a static or dynamic size.
//! * [`DynamicBatcher`] / [`InferenceClient`] — dynamic batching of
//!   request/response pairs for inference serving.
//! * [`FrameBuffer`] — a bounded, overwrite-on-full store of frames.
//! * [`Stats`] / [`SharedStats`] — the metrics map shared by the training
//!   loops and the monitor.
//! * [`Recorder`] — append-only persistence of metrics snapshots.
pub mod error;
pub mod record;

mod batcher;
mod queue;
mod replay;

pub use batcher::{DynamicBatcher, InferenceBatch, InferenceClient, InferenceRequest};
pub use queue::{BatchingQueue, BatchingQueueConfig, QueueSender, Stackable};
pub use record::{Recorder, SharedStats, StatValue, Stats};
pub use replay::FrameBuffer;
