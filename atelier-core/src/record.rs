//! Training metrics and their persistence.
//!
//! [`Stats`] is the mapping of named metrics shared by the learner loops and
//! the monitor. Every writer goes through the mutex of a [`SharedStats`]
//! handle; values follow a last-writer-wins policy and are telemetry, not
//! authoritative state. A [`Recorder`] persists snapshots append-only.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

/// A single metric value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StatValue {
    /// A scalar metric.
    Scalar(f32),

    /// An integer counter.
    Int(i64),

    /// A 1-dimensional array, e.g. the episode returns seen in one batch.
    Array1(Vec<f32>),
}

/// A mapping of named metrics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Stats {
    map: HashMap<String, StatValue>,
}

impl Stats {
    /// Creates an empty mapping.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Inserts a metric, replacing any previous value under the same name.
    pub fn insert(&mut self, key: impl Into<String>, value: StatValue) {
        self.map.insert(key.into(), value);
    }

    /// Removes a metric.
    pub fn remove(&mut self, key: &str) {
        self.map.remove(key);
    }

    /// Returns a metric value.
    pub fn get(&self, key: &str) -> Option<&StatValue> {
        self.map.get(key)
    }

    /// Returns a scalar metric.
    pub fn scalar(&self, key: &str) -> Option<f32> {
        match self.map.get(key) {
            Some(StatValue::Scalar(v)) => Some(*v),
            _ => None,
        }
    }

    /// Returns an integer counter, zero when absent.
    pub fn int(&self, key: &str) -> i64 {
        match self.map.get(key) {
            Some(StatValue::Int(v)) => *v,
            _ => 0,
        }
    }

    /// Adds `delta` to an integer counter, creating it at zero when absent.
    pub fn add_int(&mut self, key: &str, delta: i64) {
        let next = self.int(key) + delta;
        self.map.insert(key.to_string(), StatValue::Int(next));
    }

    /// Number of stored metrics.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no metrics are stored.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// One-line rendering of all metrics, sorted by name.
    pub fn summary(&self) -> String {
        let mut keys: Vec<&String> = self.map.keys().collect();
        keys.sort();
        keys.iter()
            .map(|k| format!("{} = {}", k, format_value(&self.map[*k])))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn format_value(value: &StatValue) -> String {
    match value {
        StatValue::Scalar(v) => format!("{:1.5}", v),
        StatValue::Int(v) => format!("{}", v),
        StatValue::Array1(v) => format!("[{} values]", v.len()),
    }
}

/// The stats mapping behind the single mutex shared by all writers.
#[derive(Clone, Default)]
pub struct SharedStats {
    inner: Arc<Mutex<Stats>>,
}

impl SharedStats {
    /// Creates an empty shared mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the mapping for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, Stats> {
        self.inner.lock().unwrap()
    }

    /// Returns a copy of the current mapping.
    pub fn snapshot(&self) -> Stats {
        self.lock().clone()
    }

    /// Replaces the whole mapping, e.g. when restoring a checkpoint.
    pub fn replace(&self, stats: Stats) {
        *self.lock() = stats;
    }
}

/// Append-only persistence of stats snapshots.
pub trait Recorder {
    /// Persists one snapshot.
    fn write(&mut self, stats: &Stats) -> Result<()>;
}

/// Appends one JSON object per snapshot to a log file.
pub struct JsonlRecorder {
    writer: BufWriter<File>,
}

impl JsonlRecorder {
    /// Opens (or creates) the log file at `path` for appending.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl Recorder for JsonlRecorder {
    fn write(&mut self, stats: &Stats) -> Result<()> {
        serde_json::to_writer(&mut self.writer, stats)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Discards every snapshot. Used in tests.
#[derive(Default)]
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn write(&mut self, _stats: &Stats) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn counters_accumulate() {
        let mut stats = Stats::empty();
        stats.add_int("step", 20);
        stats.add_int("step", 20);
        assert_eq!(stats.int("step"), 40);
    }

    #[test]
    fn jsonl_recorder_appends_one_line_per_write() {
        let dir = TempDir::new("atelier-record").unwrap();
        let path = dir.path().join("stats.jsonl");

        let mut stats = Stats::empty();
        stats.insert("total_loss", StatValue::Scalar(0.5));
        let mut recorder = JsonlRecorder::new(&path).unwrap();
        recorder.write(&stats).unwrap();
        stats.add_int("step", 20);
        recorder.write(&stats).unwrap();
        drop(recorder);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
