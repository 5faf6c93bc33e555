//! Hand-off of fetched records to partition workers.
//!
//! Dispatch never waits for a worker. When a worker's queue is full its
//! partition is paused and further records for it are parked in order until
//! the worker takes more; then the partition is resumed. The poll loop keeps
//! serving other partitions, cancellation and worker failures meanwhile.

use futures::stream::{FuturesUnordered, StreamExt};
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::TopicPartitionList;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::mpsc::{OwnedPermit, Sender};

use crate::worker::{Dispatched, PartitionKey};

/// Stops and restarts fetching for a single partition.
pub trait FlowControl: Send + Sync {
    fn pause(&self, topic: &str, partition: i32) -> KafkaResult<()>;
    fn resume(&self, topic: &str, partition: i32) -> KafkaResult<()>;
}

fn single(topic: &str, partition: i32) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(topic, partition);
    tpl
}

impl<C: ConsumerContext + 'static> FlowControl for Arc<StreamConsumer<C>> {
    fn pause(&self, topic: &str, partition: i32) -> KafkaResult<()> {
        Consumer::pause(self.as_ref(), &single(topic, partition))
    }

    fn resume(&self, topic: &str, partition: i32) -> KafkaResult<()> {
        Consumer::resume(self.as_ref(), &single(topic, partition))
    }
}

/// A stalled worker's queue has room again, or the worker is gone.
pub(crate) struct Ready {
    key: PartitionKey,
    generation: u64,
    slot: Result<OwnedPermit<Dispatched>, SendError<()>>,
}

type Waiting = Pin<Box<dyn Future<Output = Ready> + Send>>;

struct Stalled {
    tx: Sender<Dispatched>,
    generation: u64,
    parked: VecDeque<Dispatched>,
}

pub(crate) struct Dispatcher<F> {
    flow: F,
    stalled: HashMap<PartitionKey, Stalled>,
    waiting: FuturesUnordered<Waiting>,
    generation: u64,
}

impl<F: FlowControl> Dispatcher<F> {
    pub fn new(flow: F) -> Self {
        Self {
            flow,
            stalled: HashMap::new(),
            waiting: FuturesUnordered::new(),
            generation: 0,
        }
    }

    #[cfg(test)]
    pub fn is_stalled(&self, key: &PartitionKey) -> bool {
        self.stalled.contains_key(key)
    }

    /// Queues `item` on the worker behind `tx` without waiting.
    pub fn dispatch(&mut self, tx: Sender<Dispatched>, item: Dispatched) {
        let key = item.key();
        if let Some(stalled) = self.stalled.get_mut(&key) {
            if stalled.tx.same_channel(&tx) {
                stalled.parked.push_back(item);
                return;
            }
            // the partition got a new worker after a rebalance
            if let Some(stale) = self.stalled.remove(&key) {
                stale.parked.iter().for_each(dropped);
                self.resume(&key);
            }
        }
        match tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                let (topic, partition) = &key;
                tracing::debug!(topic, partition, "partition queue full, pausing fetch");
                if let Err(e) = self.flow.pause(topic, *partition) {
                    tracing::warn!(topic, partition, error = %e, "failed to pause partition");
                }
                self.park(key, tx, VecDeque::from([item]));
            }
            Err(TrySendError::Closed(item)) => dropped(&item),
        }
    }

    /// Resolves when a stalled worker has room again. Pending forever while
    /// nothing is stalled, so it can sit in a `select!` unconditionally.
    pub async fn ready(&mut self) -> Ready {
        match self.waiting.next().await {
            Some(ready) => ready,
            None => std::future::pending().await,
        }
    }

    /// Moves parked records of a partition into its worker, resuming the
    /// partition once nothing is left parked.
    pub fn on_ready(&mut self, ready: Ready) {
        let Ready {
            key,
            generation,
            slot,
        } = ready;
        if self.stalled.get(&key).map(|s| s.generation) != Some(generation) {
            return;
        }
        let Some(Stalled { tx, mut parked, .. }) = self.stalled.remove(&key) else {
            return;
        };
        let Ok(slot) = slot else {
            // worker stopped; its records go back to the broker uncommitted
            parked.iter().for_each(dropped);
            self.resume(&key);
            return;
        };
        if let Some(first) = parked.pop_front() {
            slot.send(first);
        }
        while let Some(item) = parked.pop_front() {
            match tx.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    parked.push_front(item);
                    self.park(key, tx, parked);
                    return;
                }
                Err(TrySendError::Closed(item)) => {
                    dropped(&item);
                    parked.iter().for_each(dropped);
                    break;
                }
            }
        }
        self.resume(&key);
    }

    fn resume(&self, key: &PartitionKey) {
        let (topic, partition) = key;
        tracing::debug!(topic, partition, "resuming partition fetch");
        if let Err(e) = self.flow.resume(topic, *partition) {
            tracing::debug!(topic, partition, error = %e, "failed to resume partition");
        }
    }

    fn park(&mut self, key: PartitionKey, tx: Sender<Dispatched>, parked: VecDeque<Dispatched>) {
        self.generation += 1;
        let generation = self.generation;
        let wait_key = key.clone();
        let wait_tx = tx.clone();
        self.waiting.push(Box::pin(async move {
            Ready {
                key: wait_key,
                generation,
                slot: wait_tx.reserve_owned().await,
            }
        }));
        self.stalled.insert(
            key,
            Stalled {
                tx,
                generation,
                parked,
            },
        );
    }
}

fn dropped(item: &Dispatched) {
    let record = item.record();
    tracing::debug!(
        topic = %record.topic,
        partition = record.partition,
        offset = record.offset,
        "record not delivered to stopped worker"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::TopicBinding;
    use crate::commit::OffsetCommitter;
    use crate::record::Record;
    use crate::worker::PartitionWorker;
    use anyhow::Result;
    use async_trait::async_trait;
    use humus::queue::Processor;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::{mpsc, Semaphore};
    use tokio_util::sync::CancellationToken;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Default)]
    struct RecordingFlow(Log);

    impl FlowControl for RecordingFlow {
        fn pause(&self, topic: &str, partition: i32) -> KafkaResult<()> {
            self.0.lock().push(format!("pause({topic}/{partition})"));
            Ok(())
        }

        fn resume(&self, topic: &str, partition: i32) -> KafkaResult<()> {
            self.0.lock().push(format!("resume({topic}/{partition})"));
            Ok(())
        }
    }

    struct NullCommitter;

    #[async_trait]
    impl OffsetCommitter for NullCommitter {
        fn store(&self, _: &str, _: i32, _: i64) -> Result<()> {
            Ok(())
        }
        async fn commit(&self, _: &str, _: i32, _: i64) -> Result<()> {
            Ok(())
        }
    }

    /// Processes a record only after the test opens the gate for it.
    struct Gate {
        open: Arc<Semaphore>,
        log: Log,
    }

    #[async_trait]
    impl Processor<Record> for Gate {
        async fn process(&self, record: &Record) -> Result<()> {
            self.open.acquire().await?.forget();
            self.log.lock().push(format!("{}/{}", record.topic, record.offset));
            Ok(())
        }
    }

    fn item(topic: &str, offset: i64, permits: &Arc<Semaphore>) -> Dispatched {
        let record = Record {
            topic: topic.into(),
            partition: 0,
            offset,
            ..Record::default()
        };
        Dispatched::new(record, permits.clone().try_acquire_owned().unwrap())
    }

    fn gated_worker(topic: &str, gate: &Arc<Semaphore>, log: &Log) -> PartitionWorker {
        let (failed_tx, _failed_rx) = mpsc::unbounded_channel();
        let binding = TopicBinding::at_least_once(
            topic,
            Gate {
                open: gate.clone(),
                log: log.clone(),
            },
        );
        PartitionWorker::spawn(&binding, 0, Arc::new(NullCommitter), 1, failed_tx)
    }

    #[tokio::test]
    async fn full_queue_pauses_then_resumes_in_order() {
        let flow = RecordingFlow::default();
        let processed = Log::default();
        let gate = Arc::new(Semaphore::new(0));
        let permits = Arc::new(Semaphore::new(16));
        let worker = gated_worker("orders", &gate, &processed);
        let key: PartitionKey = ("orders".into(), 0);

        let mut dispatcher = Dispatcher::new(flow.clone());
        for offset in 0..5 {
            dispatcher.dispatch(worker.sender(), item("orders", offset, &permits));
        }
        assert!(dispatcher.is_stalled(&key));
        assert_eq!(*flow.0.lock(), vec!["pause(orders/0)"]);

        gate.add_permits(5);
        while dispatcher.is_stalled(&key) {
            let ready = tokio::time::timeout(Duration::from_secs(1), dispatcher.ready())
                .await
                .expect("worker should make room");
            dispatcher.on_ready(ready);
        }
        assert_eq!(flow.0.lock().last().map(String::as_str), Some("resume(orders/0)"));

        worker.drain(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            *processed.lock(),
            vec!["orders/0", "orders/1", "orders/2", "orders/3", "orders/4"]
        );
        assert_eq!(permits.available_permits(), 16);
    }

    #[tokio::test]
    async fn stalled_partition_does_not_block_others_or_cancellation() {
        let flow = RecordingFlow::default();
        let processed = Log::default();
        let stuck_gate = Arc::new(Semaphore::new(0));
        let open_gate = Arc::new(Semaphore::new(100));
        let permits = Arc::new(Semaphore::new(16));
        let stuck = gated_worker("orders", &stuck_gate, &processed);
        let healthy = gated_worker("clicks", &open_gate, &processed);

        let mut dispatcher = Dispatcher::new(flow.clone());
        for offset in 0..4 {
            dispatcher.dispatch(stuck.sender(), item("orders", offset, &permits));
        }
        dispatcher.dispatch(healthy.sender(), item("clicks", 0, &permits));
        assert!(dispatcher.is_stalled(&("orders".into(), 0)));
        assert!(!dispatcher.is_stalled(&("clicks".into(), 0)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cancelled = tokio::time::timeout(Duration::from_secs(1), async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => true,
                _ = dispatcher.ready() => false,
            }
        })
        .await
        .expect("cancellation should be observed at once");
        assert!(cancelled);

        healthy.drain(Duration::from_secs(1)).await.unwrap();
        assert_eq!(*processed.lock(), vec!["clicks/0"]);

        drop(dispatcher);
        stuck.drain(Duration::from_millis(50)).await.unwrap();
        assert_eq!(permits.available_permits(), 16);
    }

    #[tokio::test]
    async fn stopped_worker_releases_parked_records() {
        let flow = RecordingFlow::default();
        let gate = Arc::new(Semaphore::new(0));
        let permits = Arc::new(Semaphore::new(16));
        let worker = gated_worker("orders", &gate, &Log::default());
        let key: PartitionKey = ("orders".into(), 0);

        let mut dispatcher = Dispatcher::new(flow.clone());
        for offset in 0..4 {
            dispatcher.dispatch(worker.sender(), item("orders", offset, &permits));
        }
        assert!(dispatcher.is_stalled(&key));

        worker.drain(Duration::from_millis(50)).await.unwrap();
        let ready = tokio::time::timeout(Duration::from_secs(1), dispatcher.ready())
            .await
            .expect("closed worker should wake the dispatcher");
        assert!(ready.slot.is_err());
        dispatcher.on_ready(ready);

        assert!(!dispatcher.is_stalled(&key));
        assert_eq!(permits.available_permits(), 16);
        assert_eq!(*flow.0.lock(), vec!["pause(orders/0)", "resume(orders/0)"]);
    }

    #[tokio::test]
    async fn replacement_worker_supersedes_stalled_partition() {
        let flow = RecordingFlow::default();
        let processed = Log::default();
        let permits = Arc::new(Semaphore::new(16));
        let revoked = gated_worker("orders", &Arc::new(Semaphore::new(0)), &processed);

        let mut dispatcher = Dispatcher::new(flow.clone());
        for offset in 0..4 {
            dispatcher.dispatch(revoked.sender(), item("orders", offset, &permits));
        }
        revoked.drain(Duration::from_millis(50)).await.unwrap();

        let reassigned = gated_worker("orders", &Arc::new(Semaphore::new(100)), &processed);
        dispatcher.dispatch(reassigned.sender(), item("orders", 10, &permits));
        assert!(!dispatcher.is_stalled(&("orders".into(), 0)));

        // the old worker's wake-up must not touch the new one
        let stale = tokio::time::timeout(Duration::from_secs(1), dispatcher.ready())
            .await
            .expect("closed worker should wake the dispatcher");
        dispatcher.on_ready(stale);

        reassigned.drain(Duration::from_secs(1)).await.unwrap();
        assert_eq!(*processed.lock(), vec!["orders/10"]);
        assert_eq!(*flow.0.lock(), vec!["pause(orders/0)", "resume(orders/0)"]);
        assert_eq!(permits.available_permits(), 16);
    }
}
