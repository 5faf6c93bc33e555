use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use super::engine::{process_queue, ItemProcessor};
use crate::app::{Configured, Hooks, Runtime};

/// Anything that can drain a queue until it ends or `cancel` fires.
#[async_trait]
pub trait QueueRuntime: Send + 'static {
    async fn process_queue(self, cancel: CancellationToken) -> Result<()>;
}

/// Runs a single [`ItemProcessor`] through the queue engine.
pub struct ItemRuntime<I> {
    items: I,
}

impl<I> ItemRuntime<I> {
    pub fn new(items: I) -> Self {
        Self { items }
    }
}

#[async_trait]
impl<I> QueueRuntime for ItemRuntime<I>
where
    I: ItemProcessor + 'static,
{
    async fn process_queue(mut self, cancel: CancellationToken) -> Result<()> {
        process_queue(&mut self.items, &cancel).await
    }
}

/// Queue application flavor.
pub struct App<Q> {
    queue: Q,
}

impl<Q: QueueRuntime> App<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl<Q: QueueRuntime> Runtime for App<Q> {
    async fn run(self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("queue application starting");
        let result = self.queue.process_queue(cancel).await;
        if result.is_ok() {
            tracing::info!("queue application finished");
        }
        result
    }
}

/// Config-driven builder for a queue application.
///
/// See [`crate::app::configured`]; `init` returns the [`QueueRuntime`] to
/// drive.
pub fn configured<C, Q, F, Fut>(
    args: humus_bootstrap::CliArgs,
    init: F,
) -> Configured<C, impl Fn(C, Hooks) -> BoxFuture<'static, Result<App<Q>>> + Send + Sync>
where
    C: DeserializeOwned + Send,
    Q: QueueRuntime,
    F: Fn(C, Hooks) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Q>> + Send + 'static,
{
    crate::app::configured(args, move |cfg: C, hooks: Hooks| {
        init(cfg, hooks).map(|r| r.map(App::new)).boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Acknowledger, AtLeastOnce, ChannelConsumer, Processor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Count(Arc<AtomicUsize>);

    #[async_trait]
    impl Processor<u32> for Count {
        async fn process(&self, _item: &u32) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Acknowledger<u32> for Count {
        async fn acknowledge(&self, _item: &u32) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn app_drains_item_runtime() {
        let (tx, rx) = mpsc::channel(8);
        for i in 0..5u32 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        let seen = Arc::new(AtomicUsize::new(0));
        let items = AtLeastOnce::new(
            ChannelConsumer::new(rx),
            Count(seen.clone()),
            Count(Arc::new(AtomicUsize::new(0))),
        );
        App::new(ItemRuntime::new(items))
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn configured_wraps_queue_runtime() {
        #[derive(serde::Deserialize)]
        struct Cfg {
            depth: usize,
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "depth: 3\n").unwrap();

        let builder = configured(
            humus_bootstrap::CliArgs {
                config: path,
                verbose: 0,
            },
            |cfg: Cfg, _hooks| async move {
                let (tx, rx) = mpsc::channel(cfg.depth);
                drop(tx);
                let items = AtLeastOnce::new(
                    ChannelConsumer::<u32>::new(rx),
                    Count(Arc::new(AtomicUsize::new(0))),
                    Count(Arc::new(AtomicUsize::new(0))),
                );
                Ok(ItemRuntime::new(items))
            },
        );

        let cancel = CancellationToken::new();
        let app = crate::app::Builder::build(&builder, &cancel).await.unwrap();
        app.run(cancel).await.unwrap();
    }
}
