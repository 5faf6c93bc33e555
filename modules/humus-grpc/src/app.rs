use anyhow::Result;
use async_trait::async_trait;
use humus::app::{Configured, Hooks, Runtime};
use humus::server::{serve_grpc, Listener, ListenerConfig};
use humus_bootstrap::CliArgs;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::api::BuiltApi;

/// Listener settings for a gRPC application.
#[derive(Debug, Clone, Deserialize)]
pub struct GrpcConfig {
    pub listener: ListenerConfig,
}

/// gRPC application flavor: serves the registered services and keeps their
/// health statuses current until cancelled.
pub struct App {
    listener: Listener,
    api: BuiltApi,
}

impl App {
    pub fn new(listener: Listener, api: BuiltApi) -> Self {
        Self { listener, api }
    }

    pub async fn from_config(cfg: &GrpcConfig, api: BuiltApi) -> Result<Self> {
        Ok(Self::new(cfg.listener.bind().await?, api))
    }
}

#[async_trait]
impl Runtime for App {
    async fn run(self, cancel: CancellationToken) -> Result<()> {
        let poller_cancel = cancel.child_token();
        let poller = tokio::spawn(self.api.health.run(poller_cancel.clone()));

        let result = serve_grpc(self.listener, self.api.routes, cancel).await;

        poller_cancel.cancel();
        if let Err(e) = poller.await {
            tracing::warn!(error = %e, "gRPC health poller task failed");
        }
        result
    }
}

/// Config-driven builder for a gRPC application. See
/// [`humus::app::configured`].
pub fn configured<C, F, Fut>(args: CliArgs, init: F) -> Configured<C, F>
where
    C: DeserializeOwned + Send,
    F: Fn(C, Hooks) -> Fut + Send + Sync,
    Fut: Future<Output = Result<App>> + Send,
{
    humus::app::configured(args, init)
}
