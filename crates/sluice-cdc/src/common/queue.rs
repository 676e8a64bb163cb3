//! Bounded outbound queue
//!
//! Shared by the streaming producer and any snapshot workers. `enqueue`
//! waits while the queue is full, which is the pipeline's flow control.
//! Cancelling a pending `enqueue` drops the record without delivering it, so
//! a record counts as processed only once `enqueue` has returned `Ok`.
//!
//! The queue also owns the snapshot exclusion scope: buffering snapshot
//! receivers running on several workers take [`ChangeEventQueue::lock_snapshot`]
//! around their swap-and-enqueue step. The streaming producer never takes it.

use crate::common::event::OutputRecord;
use crate::common::{CdcError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::trace;

/// Producer side of the outbound queue.
#[derive(Debug)]
pub struct ChangeEventQueue {
    tx: mpsc::Sender<OutputRecord>,
    capacity: usize,
    snapshot_lock: Mutex<()>,
    enqueued: AtomicU64,
}

/// Consumer side of the outbound queue, owned by the sink.
#[derive(Debug)]
pub struct ChangeEventQueueConsumer {
    rx: mpsc::Receiver<OutputRecord>,
}

impl ChangeEventQueue {
    /// Create a queue holding at most `capacity` records.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> (Arc<Self>, ChangeEventQueueConsumer) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Arc::new(Self {
            tx,
            capacity,
            snapshot_lock: Mutex::new(()),
            enqueued: AtomicU64::new(0),
        });
        (queue, ChangeEventQueueConsumer { rx })
    }

    /// Append a record, waiting while the queue is full.
    pub async fn enqueue(&self, record: OutputRecord) -> Result<()> {
        trace!(topic = %record.topic, "Enqueuing record");
        self.tx
            .send(record)
            .await
            .map_err(|_| CdcError::interrupted("outbound queue closed"))?;
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Exclusion scope shared by sibling snapshot workers.
    pub async fn lock_snapshot(&self) -> MutexGuard<'_, ()> {
        self.snapshot_lock.lock().await
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now.
    pub fn remaining_capacity(&self) -> usize {
        self.tx.capacity()
    }

    /// Total records handed off so far.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Whether the consumer side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl ChangeEventQueueConsumer {
    /// Wait for the next record. `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<OutputRecord> {
        self.rx.recv().await
    }

    /// Wait for at least one record, then drain up to `max` records.
    ///
    /// Returns an empty batch once every producer is gone.
    pub async fn poll(&mut self, max: usize) -> Vec<OutputRecord> {
        let mut batch = Vec::new();
        let Some(first) = self.rx.recv().await else {
            return batch;
        };
        batch.push(first);
        while batch.len() < max.max(1) {
            match self.rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }
        batch
    }

    /// Drain whatever is buffered without waiting.
    pub fn drain(&mut self) -> Vec<OutputRecord> {
        let mut batch = Vec::new();
        while let Ok(record) = self.rx.try_recv() {
            batch.push(record);
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::event::Headers;
    use crate::common::offset::{OffsetMap, SourcePartition};
    use std::time::Duration;

    fn record(topic: &str) -> OutputRecord {
        OutputRecord {
            source_partition: SourcePartition::new(),
            source_offset: OffsetMap::new(),
            topic: topic.to_string(),
            kafka_partition: None,
            key_schema: None,
            key: None,
            value_schema: None,
            value: None,
            timestamp: None,
            headers: Headers::new(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_poll() {
        let (queue, mut consumer) = ChangeEventQueue::new(8);
        queue.enqueue(record("a")).await.unwrap();
        queue.enqueue(record("b")).await.unwrap();
        queue.enqueue(record("c")).await.unwrap();

        let batch = consumer.poll(2).await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].topic, "a");
        assert_eq!(consumer.drain().len(), 1);
        assert_eq!(queue.enqueued(), 3);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_producer() {
        let (queue, mut consumer) = ChangeEventQueue::new(1);
        queue.enqueue(record("a")).await.unwrap();
        assert_eq!(queue.remaining_capacity(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.enqueue(record("b")));
        assert!(blocked.await.is_err(), "enqueue should wait for capacity");
        // The cancelled enqueue never reached the queue
        assert_eq!(queue.enqueued(), 1);

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(record("c")).await })
        };
        assert_eq!(consumer.recv().await.unwrap().topic, "a");
        producer.await.unwrap().unwrap();
        assert_eq!(consumer.recv().await.unwrap().topic, "c");
    }

    #[tokio::test]
    async fn test_closed_consumer_interrupts() {
        let (queue, consumer) = ChangeEventQueue::new(4);
        drop(consumer);
        assert!(queue.is_closed());
        let err = queue.enqueue(record("a")).await.unwrap_err();
        assert!(err.is_interruption());
        assert_eq!(queue.enqueued(), 0);
    }
}
