//! Per-partition workers.
//!
//! Each assigned partition gets its own task running the queue engine over a
//! bounded channel, so records of one partition are handled in offset order
//! while partitions proceed independently.

use anyhow::{Context, Result};
use async_trait::async_trait;
use humus::queue::{
    process_queue, Acknowledger, AtLeastOnce, AtMostOnce, Consumer, EndOfQueue, Processor,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::binding::{Delivery, TopicBinding};
use crate::commit::OffsetCommitter;
use crate::record::Record;

const NOTHING_PROCESSED: i64 = -1;

/// Progress of one partition, written by its worker only.
#[derive(Debug)]
pub struct PartitionState {
    last_processed: AtomicI64,
}

impl Default for PartitionState {
    fn default() -> Self {
        Self {
            last_processed: AtomicI64::new(NOTHING_PROCESSED),
        }
    }
}

impl PartitionState {
    /// Highest offset whose processing completed successfully.
    pub fn last_processed(&self) -> Option<i64> {
        match self.last_processed.load(Ordering::Acquire) {
            NOTHING_PROCESSED => None,
            offset => Some(offset),
        }
    }

    fn mark_processed(&self, offset: i64) {
        self.last_processed.fetch_max(offset, Ordering::AcqRel);
    }
}

/// A record on its way to a worker, holding one fetch permit.
pub(crate) struct Dispatched {
    record: Record,
    permit: OwnedSemaphorePermit,
}

impl Dispatched {
    pub fn new(record: Record, permit: OwnedSemaphorePermit) -> Self {
        Self { record, permit }
    }

    pub fn key(&self) -> PartitionKey {
        (self.record.topic.clone(), self.record.partition)
    }

    pub fn record(&self) -> &Record {
        &self.record
    }
}

/// Queue consumer over a worker's channel. The permit of the current record
/// is released when the next one is taken. Once `closing` fires, the queue
/// ends as soon as it is empty, whoever still holds a sender.
pub struct PartitionConsumer {
    rx: mpsc::Receiver<Dispatched>,
    held: Option<OwnedSemaphorePermit>,
    closing: CancellationToken,
}

#[async_trait]
impl Consumer<Record> for PartitionConsumer {
    async fn consume(&mut self) -> Result<Record> {
        self.held = None;
        let next = tokio::select! {
            biased;
            next = self.rx.recv() => next,
            _ = self.closing.cancelled() => self.rx.try_recv().ok(),
        };
        let next = next.ok_or(EndOfQueue)?;
        self.held = Some(next.permit);
        Ok(next.record)
    }
}

struct TrackedProcessor {
    inner: Arc<dyn Processor<Record>>,
    state: Arc<PartitionState>,
}

#[async_trait]
impl Processor<Record> for TrackedProcessor {
    async fn process(&self, record: &Record) -> Result<()> {
        self.inner.process(record).await?;
        self.state.mark_processed(record.offset);
        Ok(())
    }
}

/// Acknowledges a record by storing (at-least-once) or synchronously
/// committing (at-most-once) the offset after it.
pub struct OffsetAcknowledger {
    committer: Arc<dyn OffsetCommitter>,
    delivery: Delivery,
}

impl OffsetAcknowledger {
    pub fn new(committer: Arc<dyn OffsetCommitter>, delivery: Delivery) -> Self {
        Self { committer, delivery }
    }
}

#[async_trait]
impl Acknowledger<Record> for OffsetAcknowledger {
    async fn acknowledge(&self, record: &Record) -> Result<()> {
        let next = record.offset + 1;
        match self.delivery {
            Delivery::AtLeastOnce => self.committer.store(&record.topic, record.partition, next),
            Delivery::AtMostOnce => {
                self.committer
                    .commit(&record.topic, record.partition, next)
                    .await
            }
        }
    }
}

/// Identifies a worker: topic and partition.
pub type PartitionKey = (String, i32);

pub struct PartitionWorker {
    key: PartitionKey,
    tx: mpsc::Sender<Dispatched>,
    state: Arc<PartitionState>,
    closing: CancellationToken,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl PartitionWorker {
    /// Starts a worker for `partition` of the bound topic. When the worker
    /// fails, its key is sent on `failed`.
    pub(crate) fn spawn(
        binding: &TopicBinding,
        partition: i32,
        committer: Arc<dyn OffsetCommitter>,
        depth: usize,
        failed: mpsc::UnboundedSender<PartitionKey>,
    ) -> Self {
        let key: PartitionKey = (binding.topic.clone(), partition);
        let (tx, rx) = mpsc::channel(depth);
        let state = Arc::new(PartitionState::default());
        let closing = CancellationToken::new();
        let cancel = CancellationToken::new();

        let consumer = PartitionConsumer {
            rx,
            held: None,
            closing: closing.clone(),
        };
        let processor = TrackedProcessor {
            inner: binding.processor.clone(),
            state: state.clone(),
        };
        let acknowledger = OffsetAcknowledger::new(committer, binding.delivery);
        let delivery = binding.delivery;
        let token = cancel.clone();
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            let (topic, partition) = &task_key;
            tracing::debug!(topic, partition, ?delivery, "partition worker started");
            let result = match delivery {
                Delivery::AtLeastOnce => {
                    process_queue(&mut AtLeastOnce::new(consumer, processor, acknowledger), &token).await
                }
                Delivery::AtMostOnce => {
                    process_queue(&mut AtMostOnce::new(consumer, processor, acknowledger), &token).await
                }
            };
            match &result {
                Ok(()) => tracing::debug!(topic, partition, "partition worker stopped"),
                Err(e) => {
                    tracing::error!(topic, partition, error = format!("{e:#}"), "partition worker failed");
                    let _ = failed.send(task_key.clone());
                }
            }
            result
        });

        Self {
            key,
            tx,
            state,
            closing,
            cancel,
            task,
        }
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn state(&self) -> &Arc<PartitionState> {
        &self.state
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Dispatched> {
        self.tx.clone()
    }

    /// Closes the queue and waits for the records already in it. Past
    /// `timeout` the in-flight record is abandoned.
    pub async fn drain(self, timeout: Duration) -> Result<()> {
        let PartitionWorker {
            key: (topic, partition),
            tx,
            closing,
            cancel,
            mut task,
            ..
        } = self;
        drop(tx);
        closing.cancel();

        let joined = match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(topic, partition, ?timeout, "partition drain timed out");
                cancel.cancel();
                task.await
            }
        };
        joined.with_context(|| format!("partition worker {topic}/{partition} panicked"))?
    }
}
