use anyhow::{Context, Result};
use async_trait::async_trait;
use humus_bootstrap::config::{default_logging_config, AppConfig, CliArgs};
use humus_bootstrap::logging::init_logging;
use humus_bootstrap::telemetry::{init_telemetry, ChannelCache};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::builder::{Builder, Runtime};
use super::hooks::{Hooks, WithHooks};

/// Builder shared by every application flavor: config file, telemetry,
/// logging, then the user's initializer.
///
/// Telemetry shutdown is registered after the initializer returns, so it
/// runs as the last post-run hook and flushes whatever earlier hooks logged.
pub struct Configured<C, F> {
    args: CliArgs,
    init: F,
    _config: PhantomData<fn() -> C>,
}

/// Creates a [`Configured`] builder. `init` receives the user section of the
/// config file and the hook registry.
pub fn configured<C, R, F, Fut>(args: CliArgs, init: F) -> Configured<C, F>
where
    C: DeserializeOwned + Send,
    R: Runtime,
    F: Fn(C, Hooks) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R>> + Send,
{
    Configured {
        args,
        init,
        _config: PhantomData,
    }
}

#[async_trait]
impl<C, R, F, Fut> Builder<WithHooks<R>> for Configured<C, F>
where
    C: DeserializeOwned + Send,
    R: Runtime,
    F: Fn(C, Hooks) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R>> + Send,
{
    async fn build(&self, _cancel: &CancellationToken) -> Result<WithHooks<R>> {
        let path = &self.args.config;
        let mut cfg = AppConfig::<C>::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        cfg.apply_cli_overrides(&self.args);

        let telemetry = init_telemetry(&cfg.otel, &ChannelCache::new())?;
        let logging = cfg.logging.take().unwrap_or_else(default_logging_config);
        let base_dir = path.parent().unwrap_or(Path::new("."));
        init_logging(&logging, base_dir, &telemetry);

        let hooks = Hooks::new();
        let runtime = match (self.init)(cfg.app, hooks.clone()).await {
            Ok(rt) => rt,
            Err(e) => {
                if let Err(flush) = telemetry.shutdown() {
                    tracing::warn!(error = %flush, "telemetry shutdown after failed init");
                }
                return Err(e);
            }
        };

        hooks.add(move |_| async move { telemetry.shutdown() });
        Ok(WithHooks::new(runtime, hooks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Deserialize)]
    struct Demo {
        name: String,
    }

    struct Noop;

    #[async_trait]
    impl Runtime for Noop {
        async fn run(self, _cancel: CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    fn args_for(path: &Path) -> CliArgs {
        CliArgs {
            config: path.to_path_buf(),
            verbose: 0,
        }
    }

    #[tokio::test]
    async fn loads_user_section_and_registers_telemetry_hook_last() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "name: demo\n").unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let builder = configured(args_for(&path), move |cfg: Demo, hooks: Hooks| {
            let counter = counter.clone();
            async move {
                assert_eq!(cfg.name, "demo");
                hooks.add(move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Ok(Noop)
            }
        });

        let cancel = CancellationToken::new();
        let runtime = builder.build(&cancel).await.unwrap();
        assert_eq!(runtime.hooks().len(), 2);
        runtime.run(cancel).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_config_file_fails_build() {
        let builder = configured(
            args_for(Path::new("/nope/config.yaml")),
            |_cfg: Demo, _hooks: Hooks| async { Ok(Noop) },
        );
        let err = builder.build(&CancellationToken::new()).await.err().unwrap();
        assert!(format!("{err:#}").contains("/nope/config.yaml"));
    }
}
