//! Errors in the library.
use std::time::Duration;
use thiserror::Error;

/// Errors in the library.
#[derive(Error, Debug)]
pub enum AtelierError {
    /// The queue was closed while sending or waiting.
    #[error("queue closed")]
    QueueClosed,

    /// No item arrived within the bounded wait.
    #[error("no item received within {0:?}")]
    Stalled(Duration),

    /// The buffer does not hold enough frames for the requested sample.
    #[error("buffer holds {len} frames, cannot sample {requested}")]
    NotEnoughFrames {
        /// Number of frames currently stored.
        len: usize,
        /// Number of frames requested.
        requested: usize,
    },

    /// The number of delivered outputs does not match the pending requests.
    #[error("inference batch expects {expected} outputs, got {got}")]
    OutputCountMismatch {
        /// Number of pending requests.
        expected: usize,
        /// Number of outputs delivered.
        got: usize,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
