//! Health monitors: an atomic toggle and AND/OR composites.

use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors;

/// Asynchronous health check. `Ok(false)` is unhealthy without a cause;
/// `Err` is unhealthy because the check itself failed.
#[async_trait]
pub trait Monitor: Send + Sync {
    async fn healthy(&self) -> Result<bool>;
}

#[async_trait]
impl<M: Monitor + ?Sized> Monitor for Arc<M> {
    async fn healthy(&self) -> Result<bool> {
        (**self).healthy().await
    }
}

#[async_trait]
impl<M: Monitor + ?Sized> Monitor for Box<M> {
    async fn healthy(&self) -> Result<bool> {
        (**self).healthy().await
    }
}

/// Two-state monitor flipped by the application. Starts unhealthy.
#[derive(Debug, Default)]
pub struct Binary {
    healthy: AtomicBool,
}

impl Binary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Release);
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Monitor for Binary {
    async fn healthy(&self) -> Result<bool> {
        Ok(self.is_healthy())
    }
}

/// Healthy only if every child is. Stops at the first unhealthy or failing
/// child, in registration order. Empty is healthy.
#[derive(Default)]
pub struct And {
    monitors: Vec<Box<dyn Monitor>>,
}

impl And {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, monitor: impl Monitor + 'static) -> Self {
        self.monitors.push(Box::new(monitor));
        self
    }
}

#[async_trait]
impl Monitor for And {
    async fn healthy(&self) -> Result<bool> {
        for m in &self.monitors {
            if !m.healthy().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Healthy if any child is. Children are checked in order until one is
/// healthy; errors do not stop the scan. With no healthy child the joined
/// errors are returned, or `Ok(false)` when no child failed. Empty is
/// `Ok(false)`.
#[derive(Default)]
pub struct Or {
    monitors: Vec<Box<dyn Monitor>>,
}

impl Or {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, monitor: impl Monitor + 'static) -> Self {
        self.monitors.push(Box::new(monitor));
        self
    }
}

#[async_trait]
impl Monitor for Or {
    async fn healthy(&self) -> Result<bool> {
        let mut failures = Vec::new();
        for m in &self.monitors {
            match m.healthy().await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => failures.push(e),
            }
        }
        match errors::join(failures) {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }
}

/// Adapts an async closure into a [`Monitor`].
pub struct FnMonitor<F>(F);

pub fn monitor_fn<F, Fut>(f: F) -> FnMonitor<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    FnMonitor(f)
}

#[async_trait]
impl<F, Fut> Monitor for FnMonitor<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    async fn healthy(&self) -> Result<bool> {
        (self.0)().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, thiserror::Error)]
    #[error("probe {0} failed")]
    struct ProbeError(&'static str);

    struct Fixed(Result<bool, &'static str>);

    #[async_trait]
    impl Monitor for Fixed {
        async fn healthy(&self) -> Result<bool> {
            self.0.map_err(|name| ProbeError(name).into())
        }
    }

    struct Counting(Arc<AtomicUsize>, bool);

    #[async_trait]
    impl Monitor for Counting {
        async fn healthy(&self) -> Result<bool> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(self.1)
        }
    }

    #[tokio::test]
    async fn binary_defaults_to_unhealthy() {
        let b = Binary::default();
        assert!(!b.healthy().await.unwrap());
        b.mark_healthy();
        assert!(b.healthy().await.unwrap());
        b.mark_unhealthy();
        assert!(!b.healthy().await.unwrap());
    }

    #[tokio::test]
    async fn empty_composites() {
        assert!(And::new().healthy().await.unwrap());
        assert!(!Or::new().healthy().await.unwrap());
    }

    #[tokio::test]
    async fn and_fails_fast() {
        let calls = Arc::new(AtomicUsize::new(0));
        let and = And::new()
            .with(Fixed(Ok(true)))
            .with(Fixed(Err("db")))
            .with(Counting(calls.clone(), true));

        let err = and.healthy().await.unwrap_err();
        assert!(errors::is::<ProbeError>(&err, |e| e.0 == "db"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let and = And::new()
            .with(Fixed(Ok(false)))
            .with(Counting(calls.clone(), true));
        assert!(!and.healthy().await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn and_healthy_when_all_children_are() {
        let and = And::new().with(Fixed(Ok(true))).with(Fixed(Ok(true)));
        assert!(and.healthy().await.unwrap());
    }

    #[tokio::test]
    async fn or_checks_past_errors() {
        let or = Or::new().with(Fixed(Err("a"))).with(Fixed(Ok(true)));
        assert!(or.healthy().await.unwrap());
    }

    #[tokio::test]
    async fn or_joins_all_errors() {
        let or = Or::new()
            .with(Fixed(Err("a")))
            .with(Fixed(Ok(false)))
            .with(Fixed(Err("b")));

        let err = or.healthy().await.unwrap_err();
        assert!(errors::is::<ProbeError>(&err, |e| e.0 == "a"));
        assert!(errors::is::<ProbeError>(&err, |e| e.0 == "b"));
    }

    #[tokio::test]
    async fn or_without_errors_is_plain_unhealthy() {
        let or = Or::new().with(Fixed(Ok(false))).with(Binary::new());
        assert!(!or.healthy().await.unwrap());
    }

    #[tokio::test]
    async fn shared_binary_through_arc() {
        let flag = Arc::new(Binary::new());
        let and = And::new().with(flag.clone());
        assert!(!and.healthy().await.unwrap());
        flag.mark_healthy();
        assert!(and.healthy().await.unwrap());
    }

    #[tokio::test]
    async fn closures_as_monitors() {
        let m = monitor_fn(|| async { Ok(true) });
        assert!(m.healthy().await.unwrap());
    }
}
