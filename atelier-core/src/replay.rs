//! Bounded, overwrite-on-full storage of frames.
use crate::error::AtelierError;
use rand::{rngs::StdRng, seq::index::sample, SeedableRng};

/// A fixed-capacity circular store of single frames.
///
/// Frames are retained FIFO by write time: once the buffer is full, new
/// frames silently overwrite the oldest ones. A single push larger than the
/// whole capacity keeps only its most recent `capacity` frames.
pub struct FrameBuffer<T> {
    frames: Vec<T>,
    capacity: usize,
    position: usize,
    rng: StdRng,
}

impl<T> FrameBuffer<T> {
    /// Creates an empty buffer holding at most `capacity` frames.
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            capacity,
            position: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Inserts an ordered sequence of frames at the write position.
    ///
    /// Insertion wraps at the capacity; when the incoming sequence exceeds
    /// the remaining space, older frames are overwritten without error.
    pub fn push(&mut self, frames: Vec<T>) {
        // Frames that would be overwritten within this same call are not
        // stored at all.
        let skip = frames.len().saturating_sub(self.capacity);
        for frame in frames.into_iter().skip(skip) {
            if self.frames.len() < self.capacity {
                self.frames.push(frame);
            } else {
                self.frames[self.position] = frame;
            }
            self.position = (self.position + 1) % self.capacity;
        }
    }

    /// Number of currently stored frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frames are stored.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> FrameBuffer<T> {
    /// Draws `k` distinct frames uniformly at random, without replacement.
    ///
    /// Successive calls are independent draws over the stored frames.
    pub fn sample(&mut self, k: usize) -> Result<Vec<T>, AtelierError> {
        if self.frames.len() < k {
            return Err(AtelierError::NotEnoughFrames {
                len: self.frames.len(),
                requested: k,
            });
        }
        let ixs = sample(&mut self.rng, self.frames.len(), k);
        Ok(ixs.iter().map(|ix| self.frames[ix].clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn collect(buffer: &FrameBuffer<u32>) -> HashSet<u32> {
        buffer.frames.iter().cloned().collect()
    }

    #[test]
    fn len_tracks_min_of_capacity_and_total_pushed() {
        let mut buffer = FrameBuffer::new(8, 0);
        let mut pushed = 0;
        for chunk in &[3usize, 3, 3, 5, 1] {
            buffer.push((0..*chunk as u32).collect());
            pushed += chunk;
            assert_eq!(buffer.len(), pushed.min(8));
        }
    }

    #[test]
    fn oldest_frame_is_evicted_first() {
        let capacity = 6;
        let mut buffer = FrameBuffer::new(capacity, 0);
        for i in 0..=capacity as u32 {
            buffer.push(vec![i]);
        }
        let stored = collect(&buffer);
        assert!(!stored.contains(&0));
        assert_eq!(stored, (1..=capacity as u32).collect::<HashSet<_>>());
    }

    #[test]
    fn push_wraps_across_the_end_of_the_store() {
        let mut buffer = FrameBuffer::new(5, 0);
        buffer.push((0..4).collect());
        // Two frames fit before the end, one wraps to position zero.
        buffer.push(vec![4, 5, 6]);
        assert_eq!(buffer.len(), 5);
        let stored = collect(&buffer);
        assert_eq!(stored, (2..=6).collect::<HashSet<_>>());
    }

    #[test]
    fn oversized_push_retains_the_most_recent_frames() {
        let mut buffer = FrameBuffer::new(4, 0);
        buffer.push(vec![100]);
        // More than twice the capacity in a single call.
        buffer.push((0..10).collect());
        assert_eq!(buffer.len(), 4);
        assert_eq!(collect(&buffer), (6..10).collect::<HashSet<_>>());
    }

    #[test]
    fn full_sample_is_a_permutation() {
        let mut buffer = FrameBuffer::new(16, 7);
        buffer.push((0..16).collect());
        let sampled: HashSet<u32> = buffer.sample(16).unwrap().into_iter().collect();
        assert_eq!(sampled, (0..16).collect::<HashSet<_>>());
    }

    #[test]
    fn sampling_more_than_stored_fails() {
        let mut buffer = FrameBuffer::<u32>::new(4, 0);
        buffer.push(vec![1, 2]);
        assert!(buffer.sample(3).is_err());
    }
}
