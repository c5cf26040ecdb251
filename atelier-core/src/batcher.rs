//! Dynamic batching of inference requests.
//!
//! Actor-side threads submit single `(input)` requests through an
//! [`InferenceClient`] and block on their individual response. A serving
//! thread drains the shared [`DynamicBatcher`], which groups pending requests
//! into one [`InferenceBatch`] per forward pass and routes the outputs back
//! to the requesters that originated them.
use crate::error::AtelierError;
use crate::queue::{BatchingQueue, BatchingQueueConfig, QueueSender};
use crossbeam_channel::{bounded, select, Sender};

/// A single pending inference request.
pub struct InferenceRequest<I, O> {
    /// The request payload.
    pub input: I,
    reply: Sender<O>,
}

/// One dynamically sized batch of pending requests.
pub struct InferenceBatch<I, O> {
    requests: Vec<InferenceRequest<I, O>>,
}

impl<I, O> InferenceBatch<I, O> {
    /// The pending inputs, in request order.
    pub fn inputs(&self) -> Vec<&I> {
        self.requests.iter().map(|r| &r.input).collect()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Delivers one output per pending request, keyed by request order.
    ///
    /// Requesters that have gone away are skipped silently.
    pub fn set_outputs(self, outputs: Vec<O>) -> Result<(), AtelierError> {
        if outputs.len() != self.requests.len() {
            return Err(AtelierError::OutputCountMismatch {
                expected: self.requests.len(),
                got: outputs.len(),
            });
        }
        for (request, output) in self.requests.into_iter().zip(outputs) {
            let _ = request.reply.send(output);
        }
        Ok(())
    }
}

/// Request side of the inference batcher, used by the actor driver.
pub struct InferenceClient<I, O> {
    sender: QueueSender<InferenceRequest<I, O>>,
}

impl<I, O> Clone for InferenceClient<I, O> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<I, O> InferenceClient<I, O> {
    /// Sends one request and blocks until its output is delivered.
    ///
    /// Returns [`AtelierError::QueueClosed`] when the batcher is closed
    /// before an output could be delivered, including requests that were
    /// still pending at close time.
    pub fn infer(&self, input: I) -> Result<O, AtelierError> {
        let (reply, response) = bounded(1);
        self.sender.send(InferenceRequest { input, reply })?;
        select! {
            recv(response) -> output => output.map_err(|_| AtelierError::QueueClosed),
            recv(self.sender.closed_watch()) -> _ => Err(AtelierError::QueueClosed),
        }
    }

    /// Closes the batcher for all clients and servers.
    pub fn close(&self) {
        self.sender.close();
    }
}

/// Serving side of the inference batcher.
///
/// Clones share the same request stream; concurrent serving threads compete
/// for batches.
pub struct DynamicBatcher<I, O> {
    queue: BatchingQueue<InferenceRequest<I, O>>,
}

impl<I, O> Clone for DynamicBatcher<I, O> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<I, O> DynamicBatcher<I, O> {
    /// Creates the client and server halves of an inference batcher.
    pub fn new(config: BatchingQueueConfig) -> (InferenceClient<I, O>, DynamicBatcher<I, O>) {
        let (sender, queue) = BatchingQueue::new(config);
        (InferenceClient { sender }, DynamicBatcher { queue })
    }

    /// Returns the next batch of pending requests.
    ///
    /// Blocks until at least one request arrived; `None` once closed.
    pub fn next_batch(&self) -> Option<InferenceBatch<I, O>> {
        self.queue
            .next_items()
            .map(|requests| InferenceBatch { requests })
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no requests are pending.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Closes the batcher for all clients and servers.
    pub fn close(&self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    fn config() -> BatchingQueueConfig {
        BatchingQueueConfig::dynamic(0, 8, Duration::from_millis(10), 16)
    }

    #[test]
    fn outputs_are_keyed_to_requests() {
        let (client, batcher) = DynamicBatcher::<i64, i64>::new(config());
        let server = thread::spawn(move || {
            while let Some(batch) = batcher.next_batch() {
                let outputs = batch.inputs().iter().map(|x| **x * 2).collect();
                batch.set_outputs(outputs).unwrap();
            }
        });

        let clients: Vec<_> = (0..4)
            .map(|i| {
                let client = client.clone();
                thread::spawn(move || client.infer(i).unwrap())
            })
            .collect();
        for (i, handle) in clients.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), 2 * i as i64);
        }

        client.close();
        server.join().unwrap();
    }

    #[test]
    fn output_count_mismatch_is_an_error() {
        let (client, batcher) = DynamicBatcher::<i64, i64>::new(config());
        let waiter = thread::spawn(move || client.infer(7));
        let batch = batcher.next_batch().unwrap();
        assert!(batch.set_outputs(vec![]).is_err());
        // The request reply channel was dropped with the batch.
        assert!(waiter.join().unwrap().is_err());
    }
}
