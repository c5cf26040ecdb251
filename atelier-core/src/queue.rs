//! Closable batching queues.
//!
//! A [`BatchingQueue`] groups items sent from producer threads into batches.
//! Setting `minimum == maximum` pins a static batch size; with a timeout the
//! queue releases a partially filled batch once the wait since the first item
//! expires, which bounds latency independent of load.
//!
//! Closing the queue (from either end) ends all blocked and future sends and
//! receives without raising: consumers observe `None` and leave their loops.
use crate::error::AtelierError;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Items that can be concatenated along a batch dimension.
pub trait Stackable: Sized {
    /// Concatenates `items` along `batch_dim`.
    fn stack(batch_dim: i64, items: Vec<Self>) -> Self;
}

/// Configuration of a [`BatchingQueue`].
#[derive(Clone, Debug)]
pub struct BatchingQueueConfig {
    /// Dimension along which batch items are concatenated.
    pub batch_dim: i64,

    /// Minimum number of items in a released batch.
    pub min_batch_size: usize,

    /// Maximum number of items in a released batch.
    pub max_batch_size: usize,

    /// Wait after the first item before a partial batch is released.
    pub timeout: Option<Duration>,

    /// Maximum number of pending items before senders block.
    pub max_pending: usize,
}

impl BatchingQueueConfig {
    /// A static batch size: batches are released only when full.
    pub fn static_size(batch_dim: i64, batch_size: usize, max_pending: usize) -> Self {
        Self {
            batch_dim,
            min_batch_size: batch_size,
            max_batch_size: batch_size,
            timeout: None,
            max_pending,
        }
    }

    /// A dynamic batch size: partial batches are released after `timeout`.
    pub fn dynamic(
        batch_dim: i64,
        max_batch_size: usize,
        timeout: Duration,
        max_pending: usize,
    ) -> Self {
        Self {
            batch_dim,
            min_batch_size: 1,
            max_batch_size,
            timeout: Some(timeout),
            max_pending,
        }
    }
}

/// Dropping the stored sender disconnects the `closed` watch channel of every
/// queue handle at once.
type Closer = Arc<Mutex<Option<Sender<()>>>>;

fn close_shared(closer: &Closer) {
    closer.lock().unwrap().take();
}

/// Producer half of a [`BatchingQueue`].
pub struct QueueSender<T> {
    items: Sender<T>,
    closed: Receiver<()>,
    closer: Closer,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            closed: self.closed.clone(),
            closer: self.closer.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Sends one item, blocking while the queue is at its pending bound.
    ///
    /// Returns [`AtelierError::QueueClosed`] once the queue has been closed,
    /// so producer loops can end cleanly.
    pub fn send(&self, item: T) -> Result<(), AtelierError> {
        select! {
            send(self.items, item) -> res => res.map_err(|_| AtelierError::QueueClosed),
            recv(self.closed) -> _ => Err(AtelierError::QueueClosed),
        }
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no items are pending.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Closes the queue for all producers and consumers.
    pub fn close(&self) {
        close_shared(&self.closer);
    }

    /// Channel that disconnects once the queue is closed.
    ///
    /// Lets callers wait on an in-flight response and the queue's closure at
    /// the same time.
    pub(crate) fn closed_watch(&self) -> &Receiver<()> {
        &self.closed
    }
}

/// Consumer half of a batching queue.
///
/// Clones share the same stream of items; concurrent consumers compete for
/// batches, mirroring multiple learner threads draining one queue.
pub struct BatchingQueue<T> {
    items: Receiver<T>,
    closed: Receiver<()>,
    closer: Closer,
    config: BatchingQueueConfig,
}

impl<T> Clone for BatchingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            closed: self.closed.clone(),
            closer: self.closer.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T> BatchingQueue<T> {
    /// Creates the producer and consumer halves of a queue.
    pub fn new(config: BatchingQueueConfig) -> (QueueSender<T>, BatchingQueue<T>) {
        let (items_s, items_r) = bounded(config.max_pending);
        let (closed_s, closed_r) = bounded(0);
        let closer = Arc::new(Mutex::new(Some(closed_s)));
        let sender = QueueSender {
            items: items_s,
            closed: closed_r.clone(),
            closer: closer.clone(),
        };
        let queue = BatchingQueue {
            items: items_r,
            closed: closed_r,
            closer,
            config,
        };
        (sender, queue)
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no items are pending.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Closes the queue for all producers and consumers.
    pub fn close(&self) {
        close_shared(&self.closer);
    }

    /// Collects the items of the next batch.
    ///
    /// Blocks until the batch is released. `None` once the queue is closed.
    pub fn next_items(&self) -> Option<Vec<T>> {
        match self.collect(None) {
            Ok(items) => items,
            Err(_) => None,
        }
    }

    /// Like [`next_items`](Self::next_items), with a bound on the wait for
    /// the first item. [`AtelierError::Stalled`] when nothing arrived in
    /// `wait`.
    pub fn next_items_within(&self, wait: Duration) -> Result<Option<Vec<T>>, AtelierError> {
        self.collect(Some(wait))
    }

    fn collect(&self, first_wait: Option<Duration>) -> Result<Option<Vec<T>>, AtelierError> {
        let mut items = Vec::with_capacity(self.config.max_batch_size);

        // The first item is awaited unconditionally (or within `first_wait`).
        match first_wait {
            Some(wait) => select! {
                recv(self.items) -> item => match item {
                    Ok(item) => items.push(item),
                    Err(_) => return Ok(None),
                },
                recv(self.closed) -> _ => return Ok(None),
                default(wait) => return Err(AtelierError::Stalled(wait)),
            },
            None => select! {
                recv(self.items) -> item => match item {
                    Ok(item) => items.push(item),
                    Err(_) => return Ok(None),
                },
                recv(self.closed) -> _ => return Ok(None),
            },
        }

        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        while items.len() < self.config.max_batch_size {
            // Once the minimum is met, only wait up to the deadline.
            let wait = match deadline {
                Some(deadline) if items.len() >= self.config.min_batch_size => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    Some(deadline - now)
                }
                _ => None,
            };
            match wait {
                Some(wait) => select! {
                    recv(self.items) -> item => match item {
                        Ok(item) => items.push(item),
                        Err(_) => break,
                    },
                    recv(self.closed) -> _ => break,
                    default(wait) => break,
                },
                None => select! {
                    recv(self.items) -> item => match item {
                        Ok(item) => items.push(item),
                        Err(_) => break,
                    },
                    recv(self.closed) -> _ => break,
                },
            }
        }

        if items.len() < self.config.min_batch_size {
            // Closed mid-collection with a short batch: the partial batch is
            // dropped and the consumer leaves its loop.
            return Ok(None);
        }
        Ok(Some(items))
    }
}

impl<T: Stackable> BatchingQueue<T> {
    /// Returns the next batch, stacked along the configured batch dimension.
    ///
    /// `None` once the queue is closed.
    pub fn next_batch(&self) -> Option<T> {
        let batch_dim = self.config.batch_dim;
        self.next_items()
            .map(|items| T::stack(batch_dim, items))
    }

    /// Like [`next_batch`](Self::next_batch), with a bound on the wait for
    /// the first item.
    pub fn next_batch_within(&self, wait: Duration) -> Result<Option<T>, AtelierError> {
        let batch_dim = self.config.batch_dim;
        Ok(self
            .next_items_within(wait)?
            .map(|items| T::stack(batch_dim, items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    impl Stackable for Vec<f32> {
        fn stack(_batch_dim: i64, items: Vec<Self>) -> Self {
            items.into_iter().flatten().collect()
        }
    }

    #[test]
    fn static_queue_releases_full_batches() {
        let config = BatchingQueueConfig::static_size(0, 4, 8);
        let (sender, queue) = BatchingQueue::<Vec<f32>>::new(config);
        for i in 0..8 {
            sender.send(vec![i as f32]).unwrap();
        }
        assert_eq!(queue.next_batch().unwrap().len(), 4);
        assert_eq!(queue.next_batch().unwrap().len(), 4);
    }

    #[test]
    fn dynamic_queue_releases_partial_batch_on_timeout() {
        let config = BatchingQueueConfig::dynamic(0, 64, Duration::from_millis(20), 64);
        let (sender, queue) = BatchingQueue::<Vec<f32>>::new(config);
        sender.send(vec![1.0]).unwrap();
        sender.send(vec![2.0]).unwrap();
        let batch = queue.next_batch().unwrap();
        assert_eq!(batch, vec![1.0, 2.0]);
    }

    #[test]
    fn close_unblocks_consumers() {
        let config = BatchingQueueConfig::static_size(0, 4, 8);
        let (sender, queue) = BatchingQueue::<Vec<f32>>::new(config);
        let handle = thread::spawn(move || queue.next_batch());
        thread::sleep(Duration::from_millis(20));
        sender.close();
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn send_fails_after_close() {
        let config = BatchingQueueConfig::static_size(0, 2, 2);
        let (sender, queue) = BatchingQueue::<Vec<f32>>::new(config);
        queue.close();
        assert!(sender.send(vec![0.0]).is_err());
    }

    #[test]
    fn stalled_wait_is_reported() {
        let config = BatchingQueueConfig::dynamic(0, 4, Duration::from_millis(10), 4);
        let (_sender, queue) = BatchingQueue::<Vec<f32>>::new(config);
        match queue.next_batch_within(Duration::from_millis(20)) {
            Err(AtelierError::Stalled(_)) => (),
            other => panic!("expected stall, got {:?}", other.map(|_| ())),
        }
    }
}
