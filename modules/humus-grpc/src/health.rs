//! Poll-backed `grpc.health.v1.Health` statuses.

use humus::health::Monitor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Name under which the standard health service is mounted.
pub const HEALTH_SERVICE_NAME: &str = "grpc.health.v1.Health";

/// Periodically asks each service's monitor for its health and publishes the
/// answer through the health reporter.
///
/// A status is only republished when it changes, so `Watch` streams see
/// transitions and nothing else.
pub struct HealthPoller {
    reporter: HealthReporter,
    monitors: Vec<(&'static str, Arc<dyn Monitor>)>,
    interval: Duration,
    last: HashMap<&'static str, ServingStatus>,
}

impl HealthPoller {
    pub(crate) fn new(
        reporter: HealthReporter,
        monitors: Vec<(&'static str, Arc<dyn Monitor>)>,
        interval: Duration,
    ) -> Self {
        Self {
            reporter,
            monitors,
            interval,
            last: HashMap::new(),
        }
    }

    /// Services with a registered monitor.
    pub fn services(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.monitors.iter().map(|(name, _)| *name)
    }

    /// Checks every monitor once and publishes changed statuses.
    pub async fn poll_once(&mut self) {
        for (name, monitor) in &self.monitors {
            let status = status_of(name, monitor.as_ref()).await;
            if self.last.get(name) == Some(&status) {
                continue;
            }
            tracing::debug!(service = name, status = ?status, "gRPC health status changed");
            self.reporter.set_service_status(*name, status).await;
            self.last.insert(*name, status);
        }
    }

    /// Polls immediately and then every interval until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        if self.monitors.is_empty() {
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.poll_once().await,
            }
        }
        tracing::debug!("gRPC health poller stopped");
    }
}

async fn status_of(name: &str, monitor: &dyn Monitor) -> ServingStatus {
    match monitor.healthy().await {
        Ok(true) => ServingStatus::Serving,
        Ok(false) => ServingStatus::NotServing,
        Err(e) => {
            tracing::warn!(service = name, error = format!("{e:#}"), "gRPC health check failed");
            ServingStatus::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use humus::health::{monitor_fn, Binary};

    #[tokio::test]
    async fn status_follows_monitor_result() {
        let ok = Binary::new();
        ok.mark_healthy();
        assert_eq!(status_of("a", &ok).await, ServingStatus::Serving);
        assert_eq!(status_of("b", &Binary::new()).await, ServingStatus::NotServing);

        let failing = monitor_fn(|| async { Err::<bool, _>(anyhow::anyhow!("db down")) });
        assert_eq!(status_of("c", &failing).await, ServingStatus::Unknown);
    }

    #[tokio::test]
    async fn poll_once_only_records_transitions() {
        let (reporter, _service) = tonic_health::server::health_reporter();
        let monitor = Arc::new(Binary::new());
        let mut poller = HealthPoller::new(
            reporter,
            vec![("test.Svc", monitor.clone() as Arc<dyn Monitor>)],
            DEFAULT_POLL_INTERVAL,
        );

        poller.poll_once().await;
        assert_eq!(poller.last.get("test.Svc"), Some(&ServingStatus::NotServing));

        monitor.mark_healthy();
        poller.poll_once().await;
        assert_eq!(poller.last.get("test.Svc"), Some(&ServingStatus::Serving));
        assert_eq!(poller.services().collect::<Vec<_>>(), vec!["test.Svc"]);
    }

    #[tokio::test]
    async fn run_returns_on_cancel() {
        let (reporter, _service) = tonic_health::server::health_reporter();
        let poller = HealthPoller::new(
            reporter,
            vec![("test.Svc", Arc::new(Binary::new()) as Arc<dyn Monitor>)],
            Duration::from_millis(10),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poller.run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("poller should stop")
            .unwrap();
    }
}
