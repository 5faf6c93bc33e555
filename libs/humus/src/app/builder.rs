use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;

/// A deferred computation producing a `T`.
///
/// Builders hold no state between calls; evaluating one twice builds two
/// independent values.
#[async_trait]
pub trait Builder<T>: Send + Sync {
    async fn build(&self, cancel: &CancellationToken) -> Result<T>;
}

/// Something that runs until done, failed, or cancelled.
///
/// The REST, gRPC and queue applications all implement this; so does the
/// hook-running wrapper produced by [`super::with_hooks`].
#[async_trait]
pub trait Runtime: Send + 'static {
    async fn run(self, cancel: CancellationToken) -> Result<()>;
}

/// Lifts an async closure into a [`Builder`].
pub struct BuilderFn<F>(F);

pub fn builder_fn<T, F, Fut>(f: F) -> BuilderFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send,
{
    BuilderFn(f)
}

#[async_trait]
impl<T, F, Fut> Builder<T> for BuilderFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    async fn build(&self, cancel: &CancellationToken) -> Result<T> {
        (self.0)(cancel.clone()).await
    }
}

/// Sequencing combinator produced by [`bind`].
pub struct Bind<A, F, TA> {
    first: A,
    next: F,
    _first: PhantomData<fn() -> TA>,
}

/// Evaluates `first`, feeds its value to `next`, then evaluates the builder
/// `next` returns. A failure of `first` short-circuits.
pub fn bind<TA, TB, A, B, F>(first: A, next: F) -> Bind<A, F, TA>
where
    A: Builder<TA>,
    B: Builder<TB>,
    F: Fn(TA) -> B + Send + Sync,
{
    Bind {
        first,
        next,
        _first: PhantomData,
    }
}

#[async_trait]
impl<TA, TB, A, B, F> Builder<TB> for Bind<A, F, TA>
where
    A: Builder<TA>,
    B: Builder<TB> + Send,
    F: Fn(TA) -> B + Send + Sync,
    TA: Send,
    TB: Send,
{
    async fn build(&self, cancel: &CancellationToken) -> Result<TB> {
        let value = self.first.build(cancel).await?;
        (self.next)(value).build(cancel).await
    }
}
