use anyhow::Result;
use async_trait::async_trait;
use humus::queue::QueueRuntime;
use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::ClientContext;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::binding::TopicBinding;
use crate::commit::{commit_stored, KafkaCommitter, OffsetCommitter};
use crate::config::KafkaConfig;
use crate::dispatch::Dispatcher;
use crate::record::Record;
use crate::worker::{Dispatched, PartitionKey, PartitionWorker};

#[derive(Debug, thiserror::Error)]
pub enum KafkaRuntimeError {
    #[error("invalid Kafka configuration: {0}")]
    Config(String),
    #[error("no topic bindings")]
    NoBindings,
    #[error("topic {0} is bound more than once")]
    DuplicateTopic(String),
    #[error("Kafka client error")]
    Client(#[from] KafkaError),
}

type Workers = Arc<Mutex<HashMap<PartitionKey, PartitionWorker>>>;

/// Consumer context that drains revoked partitions before giving them up.
struct RebalanceContext {
    workers: Workers,
    drain_timeout: Duration,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let Rebalance::Revoke(tpl) = rebalance else {
            return;
        };
        let revoked: Vec<PartitionKey> = tpl
            .elements()
            .iter()
            .map(|e| (e.topic().to_owned(), e.partition()))
            .collect();
        let draining: Vec<PartitionWorker> = {
            let mut workers = self.workers.lock();
            revoked.iter().filter_map(|key| workers.remove(key)).collect()
        };
        tracing::info!(
            revoked = revoked.len(),
            draining = draining.len(),
            "partitions revoked"
        );

        if !draining.is_empty() {
            block_on_drain(draining, self.drain_timeout);
        }
        if let Err(e) = commit_stored(base_consumer) {
            tracing::warn!(error = %e, "offset commit on revoke failed");
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            tracing::info!(assigned = tpl.count(), "partitions assigned");
        }
    }
}

/// Rebalance callbacks run inside the consumer poll, so waiting for async
/// workers has to leave the runtime worker thread free.
fn block_on_drain(workers: Vec<PartitionWorker>, timeout: Duration) {
    let handle = match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => handle,
        _ => {
            tracing::warn!("cannot drain revoked partitions outside a multi-threaded runtime");
            return;
        }
    };
    tokio::task::block_in_place(|| {
        handle.block_on(async {
            for result in drain_all(workers, timeout).await {
                if let Err(e) = result {
                    tracing::warn!(error = format!("{e:#}"), "revoked partition worker failed");
                }
            }
        });
    });
}

async fn drain_all(workers: impl IntoIterator<Item = PartitionWorker>, timeout: Duration) -> Vec<Result<()>> {
    let tasks: Vec<_> = workers
        .into_iter()
        .map(|w| tokio::spawn(w.drain(timeout)))
        .collect();
    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.await.map_err(anyhow::Error::from).and_then(|r| r));
    }
    results
}

/// Consumer-group runtime: one ordered worker per assigned partition, each
/// running the queue engine with its topic's delivery semantics.
pub struct KafkaRuntime {
    config: KafkaConfig,
    bindings: HashMap<String, TopicBinding>,
}

impl KafkaRuntime {
    pub fn new(
        config: KafkaConfig,
        bindings: impl IntoIterator<Item = TopicBinding>,
    ) -> Result<Self, KafkaRuntimeError> {
        let mut by_topic = HashMap::new();
        for binding in bindings {
            if by_topic.contains_key(&binding.topic) {
                return Err(KafkaRuntimeError::DuplicateTopic(binding.topic));
            }
            by_topic.insert(binding.topic.clone(), binding);
        }
        if by_topic.is_empty() {
            return Err(KafkaRuntimeError::NoBindings);
        }
        config.client_config()?;
        Ok(Self {
            config,
            bindings: by_topic,
        })
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }
}

/// How the poll loop ended.
enum Stop {
    Cancelled,
    WorkerFailed(PartitionKey),
    Client(KafkaError),
}

#[async_trait]
impl QueueRuntime for KafkaRuntime {
    async fn process_queue(self, cancel: CancellationToken) -> Result<()> {
        let workers: Workers = Arc::default();
        let context = RebalanceContext {
            workers: workers.clone(),
            drain_timeout: self.config.rebalance_timeout,
        };
        let consumer: Arc<StreamConsumer<RebalanceContext>> = Arc::new(
            self.config
                .client_config()?
                .create_with_context(context)
                .map_err(KafkaRuntimeError::Client)?,
        );
        let topics: Vec<&str> = self.topics().collect();
        consumer
            .subscribe(&topics)
            .map_err(KafkaRuntimeError::Client)?;
        tracing::info!(
            group = %self.config.group_id,
            topics = ?topics,
            "Kafka consumer subscribed"
        );

        let committer: Arc<dyn OffsetCommitter> = Arc::new(KafkaCommitter::new(consumer.clone()));
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_fetches));
        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
        // Full partition queues pause their partition instead of blocking the loop.
        let mut dispatcher = Dispatcher::new(consumer.clone());

        let stop = loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Stop::Cancelled,
                Some(key) = failed_rx.recv() => break Stop::WorkerFailed(key),
                ready = dispatcher.ready() => {
                    dispatcher.on_ready(ready);
                    continue;
                }
                permit = permits.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                break Stop::Cancelled;
            };
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Stop::Cancelled,
                Some(key) = failed_rx.recv() => break Stop::WorkerFailed(key),
                ready = dispatcher.ready() => {
                    dispatcher.on_ready(ready);
                    continue;
                }
                msg = consumer.recv() => msg.map(|m| Record::from_message(&m)),
            };
            let record = match fetched {
                Ok(record) => record,
                Err(e) if is_fatal(&e) => break Stop::Client(e),
                Err(e) => {
                    tracing::warn!(error = %e, "Kafka fetch error");
                    continue;
                }
            };

            let Some(binding) = self.bindings.get(&record.topic) else {
                tracing::warn!(topic = %record.topic, "record for unbound topic dropped");
                continue;
            };
            let tx = workers
                .lock()
                .entry((record.topic.clone(), record.partition))
                .or_insert_with(|| {
                    PartitionWorker::spawn(
                        binding,
                        record.partition,
                        committer.clone(),
                        self.config.queue_depth,
                        failed_tx.clone(),
                    )
                })
                .sender();
            dispatcher.dispatch(tx, Dispatched::new(record, permit));
        };
        drop(dispatcher);

        let failure = match stop {
            Stop::Cancelled => {
                tracing::info!("Kafka runtime stopping");
                None
            }
            Stop::WorkerFailed((topic, partition)) => {
                tracing::error!(%topic, partition, "Kafka runtime stopping after worker failure");
                None
            }
            Stop::Client(e) => Some(anyhow::Error::from(KafkaRuntimeError::Client(e))),
        };

        let remaining: Vec<PartitionWorker> = workers.lock().drain().map(|(_, w)| w).collect();
        let mut errors: Vec<anyhow::Error> = failure.into_iter().collect();
        errors.extend(
            drain_all(remaining, self.config.rebalance_timeout)
                .await
                .into_iter()
                .filter_map(Result::err),
        );

        if let Err(e) = commit_stored(consumer.as_ref()) {
            errors.push(anyhow::Error::from(KafkaRuntimeError::Client(e)).context("final offset commit failed"));
        }
        consumer.unsubscribe();
        drop(committer);
        drop(consumer);
        tracing::info!("Kafka consumer closed");

        match humus::errors::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn is_fatal(err: &KafkaError) -> bool {
    err.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal)
}
