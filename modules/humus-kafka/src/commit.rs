use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;

/// Offset bookkeeping used by partition workers.
///
/// Offsets passed here are the *next* offset to consume, i.e. one past the
/// record that was handled.
#[async_trait]
pub trait OffsetCommitter: Send + Sync + 'static {
    /// Records `next_offset` for the client's next commit.
    fn store(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()>;

    /// Commits `next_offset` and waits for the broker to accept it.
    async fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()>;
}

/// [`OffsetCommitter`] backed by the group consumer itself.
pub struct KafkaCommitter<C: ConsumerContext + 'static> {
    consumer: Arc<StreamConsumer<C>>,
}

impl<C: ConsumerContext + 'static> KafkaCommitter<C> {
    pub fn new(consumer: Arc<StreamConsumer<C>>) -> Self {
        Self { consumer }
    }
}

#[async_trait]
impl<C: ConsumerContext + 'static> OffsetCommitter for KafkaCommitter<C> {
    fn store(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        self.consumer
            .store_offset(topic, partition, next_offset)
            .with_context(|| format!("failed to store offset {next_offset} for {topic}/{partition}"))
    }

    async fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next_offset))?;
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .context("offset commit task failed")?
            .with_context(|| format!("failed to commit offset {next_offset} for {topic}/{partition}"))
    }
}

/// Synchronously commits whatever offsets the consumer has stored. Having
/// nothing to commit is not an error.
pub(crate) fn commit_stored<C, K>(consumer: &K) -> Result<(), KafkaError>
where
    C: ConsumerContext + 'static,
    K: Consumer<C> + ?Sized,
{
    match consumer.commit_consumer_state(CommitMode::Sync) {
        Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
        other => other,
    }
}
