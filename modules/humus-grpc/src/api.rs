use humus::health::Monitor;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::{Routes, RoutesBuilder};
use tower::Service;

use crate::health::{HealthPoller, DEFAULT_POLL_INTERVAL, HEALTH_SERVICE_NAME};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("gRPC service {0} registered more than once")]
    DuplicateService(&'static str),
}

struct Registration {
    name: &'static str,
    install: Box<dyn FnOnce(&mut RoutesBuilder) + Send>,
}

/// Collects tonic services for a single gRPC server.
///
/// Every server carries the standard health service. Services registered
/// through [`Api::register_with_health`] get a status entry that a background
/// poller keeps current.
pub struct Api {
    services: Vec<Registration>,
    monitors: Vec<(&'static str, Arc<dyn Monitor>)>,
    poll_interval: Duration,
}

/// Routes ready to serve plus the poller feeding the health service.
pub struct BuiltApi {
    pub routes: Routes,
    pub health: HealthPoller,
}

impl Default for Api {
    fn default() -> Self {
        Self::new()
    }
}

impl Api {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            monitors: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn register<S>(mut self, service: S) -> Self
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.services.push(Registration {
            name: S::NAME,
            install: Box::new(move |routes| {
                routes.add_service(service);
            }),
        });
        self
    }

    /// Registers `service` and reports its health from `monitor` under
    /// `S::NAME`.
    #[must_use]
    pub fn register_with_health<S>(self, service: S, monitor: impl Monitor + 'static) -> Self
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let mut api = self.register(service);
        api.monitors.push((S::NAME, Arc::new(monitor)));
        api
    }

    /// How often monitors are polled. Defaults to 10 seconds.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn build(self) -> Result<BuiltApi, ApiError> {
        let mut seen = HashSet::from([HEALTH_SERVICE_NAME]);
        for svc in &self.services {
            if !seen.insert(svc.name) {
                return Err(ApiError::DuplicateService(svc.name));
            }
        }

        let (reporter, health_service) = tonic_health::server::health_reporter();
        let mut routes = RoutesBuilder::default();
        routes.add_service(health_service);
        let count = self.services.len();
        for svc in self.services {
            (svc.install)(&mut routes);
        }

        tracing::info!(
            services = count,
            monitored = self.monitors.len(),
            "gRPC API built"
        );
        Ok(BuiltApi {
            routes: routes.routes(),
            health: HealthPoller::new(reporter, self.monitors, self.poll_interval),
        })
    }
}
