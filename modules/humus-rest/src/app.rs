use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use humus::app::{Configured, Hooks, Runtime};
use humus::server::{serve_http, HttpServerConfig, Listener, ListenerConfig};
use humus_bootstrap::CliArgs;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::api::BuiltApi;

/// Listener and connection limits for a REST application, usually embedded
/// in the application's own config section.
#[derive(Debug, Clone, Deserialize)]
pub struct RestConfig {
    pub listener: ListenerConfig,
    #[serde(default)]
    pub server: HttpServerConfig,
}

/// REST application flavor: serves a built API until cancelled.
pub struct App {
    listener: Listener,
    router: Router,
    cfg: HttpServerConfig,
}

impl App {
    pub fn new(listener: Listener, api: BuiltApi) -> Self {
        Self {
            listener,
            router: api.router,
            cfg: HttpServerConfig::default(),
        }
    }

    /// Binds `cfg.listener` and applies `cfg.server`.
    pub async fn from_config(cfg: &RestConfig, api: BuiltApi) -> Result<Self> {
        let listener = cfg.listener.bind().await?;
        Ok(Self::new(listener, api).with_config(cfg.server.clone()))
    }

    #[must_use]
    pub fn with_config(mut self, cfg: HttpServerConfig) -> Self {
        self.cfg = cfg;
        self
    }
}

#[async_trait]
impl Runtime for App {
    async fn run(self, cancel: CancellationToken) -> Result<()> {
        serve_http(self.listener, self.router, &self.cfg, cancel).await
    }
}

/// Config-driven builder for a REST application. See
/// [`humus::app::configured`].
pub fn configured<C, F, Fut>(args: CliArgs, init: F) -> Configured<C, F>
where
    C: DeserializeOwned + Send,
    F: Fn(C, Hooks) -> Fut + Send + Sync,
    Fut: Future<Output = Result<App>> + Send,
{
    humus::app::configured(args, init)
}
