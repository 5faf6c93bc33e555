use anyhow::Result;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Returned by a [`Consumer`] to end the queue cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("end of queue")]
pub struct EndOfQueue;

/// Reports whether `err` is (or wraps) the end-of-queue sentinel.
pub fn is_end_of_queue(err: &anyhow::Error) -> bool {
    crate::errors::is_kind::<EndOfQueue>(err)
}

/// Source of queue items. Return [`EndOfQueue`] when no more items will come.
#[async_trait]
pub trait Consumer<T>: Send {
    async fn consume(&mut self) -> Result<T>;
}

/// User work for one item.
#[async_trait]
pub trait Processor<T>: Send + Sync {
    async fn process(&self, item: &T) -> Result<()>;
}

#[async_trait]
impl<T: Sync, P: Processor<T> + ?Sized> Processor<T> for Arc<P> {
    async fn process(&self, item: &T) -> Result<()> {
        (**self).process(item).await
    }
}

/// Records progress for one item (offset commit, message delete, ...).
#[async_trait]
pub trait Acknowledger<T>: Send + Sync {
    async fn acknowledge(&self, item: &T) -> Result<()>;
}

/// One step of a queue loop: take an item and see it through.
#[async_trait]
pub trait ItemProcessor: Send {
    async fn process_item(&mut self) -> Result<()>;
}

/// consume → acknowledge → process. A processing failure loses the item.
pub struct AtMostOnce<T, C, P, A> {
    consumer: C,
    processor: P,
    acknowledger: A,
    _item: PhantomData<fn() -> T>,
}

impl<T, C, P, A> AtMostOnce<T, C, P, A>
where
    C: Consumer<T>,
    P: Processor<T>,
    A: Acknowledger<T>,
{
    pub fn new(consumer: C, processor: P, acknowledger: A) -> Self {
        Self {
            consumer,
            processor,
            acknowledger,
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<T, C, P, A> ItemProcessor for AtMostOnce<T, C, P, A>
where
    T: Send + Sync,
    C: Consumer<T>,
    P: Processor<T>,
    A: Acknowledger<T>,
{
    async fn process_item(&mut self) -> Result<()> {
        let item = self.consumer.consume().await?;
        self.acknowledger.acknowledge(&item).await?;
        self.processor.process(&item).await
    }
}

/// consume → process → acknowledge. A processing failure leaves the item
/// unacknowledged for redelivery, so processors must be idempotent.
pub struct AtLeastOnce<T, C, P, A> {
    consumer: C,
    processor: P,
    acknowledger: A,
    _item: PhantomData<fn() -> T>,
}

impl<T, C, P, A> AtLeastOnce<T, C, P, A>
where
    C: Consumer<T>,
    P: Processor<T>,
    A: Acknowledger<T>,
{
    pub fn new(consumer: C, processor: P, acknowledger: A) -> Self {
        Self {
            consumer,
            processor,
            acknowledger,
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<T, C, P, A> ItemProcessor for AtLeastOnce<T, C, P, A>
where
    T: Send + Sync,
    C: Consumer<T>,
    P: Processor<T>,
    A: Acknowledger<T>,
{
    async fn process_item(&mut self) -> Result<()> {
        let item = self.consumer.consume().await?;
        self.processor.process(&item).await?;
        self.acknowledger.acknowledge(&item).await
    }
}

/// Drives `items` until the consumer signals [`EndOfQueue`] (`Ok`), a step
/// fails (`Err`), or `cancel` fires (`Ok`).
///
/// Cancellation is observed between items and while a step is suspended;
/// an item interrupted that way may not have been acknowledged.
pub async fn process_queue<I>(items: &mut I, cancel: &CancellationToken) -> Result<()>
where
    I: ItemProcessor + ?Sized,
{
    loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("queue loop cancelled");
                return Ok(());
            }
            step = items.process_item() => step,
        };

        match step {
            Ok(()) => {}
            Err(e) if is_end_of_queue(&e) => {
                tracing::debug!("queue drained");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

/// [`Consumer`] over a channel; a closed, drained channel is the end of
/// the queue.
pub struct ChannelConsumer<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> ChannelConsumer<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl<T: Send> Consumer<T> for ChannelConsumer<T> {
    async fn consume(&mut self) -> Result<T> {
        self.rx.recv().await.ok_or_else(|| EndOfQueue.into())
    }
}
