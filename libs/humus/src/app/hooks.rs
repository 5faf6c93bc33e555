use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::builder::{Builder, Runtime};
use crate::errors;

type Hook = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

/// Ordered, append-only list of post-run hooks.
///
/// Cloning shares the list. Hooks are registered while a builder runs and
/// executed once, in order, after the runtime returns.
#[derive(Clone, Default)]
pub struct Hooks {
    hooks: Arc<Mutex<Vec<Hook>>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, Fut>(&self, hook: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hooks.lock().push(Box::new(move |cancel| Box::pin(hook(cancel))));
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every hook in registration order and returns all failures.
    /// A failing hook never prevents the next one from running.
    pub async fn run_all(&self, cancel: &CancellationToken) -> Vec<anyhow::Error> {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        let mut failures = Vec::new();
        for (index, hook) in hooks.into_iter().enumerate() {
            if let Err(e) = hook(cancel.clone()).await {
                tracing::warn!(hook = index, error = %e, "post-run hook failed");
                failures.push(e);
            }
        }
        failures
    }
}

/// Runtime wrapper that executes the registered hooks after the inner
/// runtime returns, whatever its outcome.
pub struct WithHooks<R> {
    runtime: R,
    hooks: Hooks,
}

impl<R> WithHooks<R> {
    pub fn new(runtime: R, hooks: Hooks) -> Self {
        Self { runtime, hooks }
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }
}

#[async_trait]
impl<R: Runtime> Runtime for WithHooks<R> {
    async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut failures = Vec::new();

        if let Err(e) = self.runtime.run(cancel.clone()).await {
            tracing::error!(error = %e, "runtime terminated with error");
            failures.push(e);
        }
        failures.extend(self.hooks.run_all(&cancel).await);

        match errors::join(failures) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Builder produced by [`with_hooks`].
pub struct HooksBuilder<F> {
    init: F,
}

/// Wraps a builder body that may register post-run hooks.
///
/// The produced runtime runs the body's runtime, then every hook in order,
/// and returns the join of all errors. If the body fails, no hook runs.
pub fn with_hooks<R, F, Fut>(init: F) -> HooksBuilder<F>
where
    R: Runtime,
    F: Fn(CancellationToken, Hooks) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R>> + Send,
{
    HooksBuilder { init }
}

#[async_trait]
impl<R, F, Fut> Builder<WithHooks<R>> for HooksBuilder<F>
where
    R: Runtime,
    F: Fn(CancellationToken, Hooks) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R>> + Send,
{
    async fn build(&self, cancel: &CancellationToken) -> Result<WithHooks<R>> {
        let hooks = Hooks::new();
        let runtime = (self.init)(cancel.clone(), hooks.clone()).await?;
        Ok(WithHooks::new(runtime, hooks))
    }
}
