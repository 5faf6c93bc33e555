use anyhow::Result;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

use super::builder::{Builder, Runtime};

/// Builds and runs an application until it finishes or a SIGINT/SIGTERM
/// arrives.
///
/// A build failure is returned without running anything, so no hook fires.
pub async fn run<T, B>(builder: B) -> Result<()>
where
    B: Builder<T>,
    T: Runtime,
{
    let root = CancellationToken::new();
    let cancel = humus_bootstrap::signals::cancel_on_shutdown(&root);
    let result = run_with_cancel(builder, cancel).await;
    // stops the signal watcher if nothing cancelled it
    root.cancel();
    result
}

/// Same as [`run`] but driven by an external token instead of OS signals.
pub async fn run_with_cancel<T, B>(builder: B, cancel: CancellationToken) -> Result<()>
where
    B: Builder<T>,
    T: Runtime,
{
    let runtime = match builder.build(&cancel).await {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Application build failed; not starting");
            return Err(e);
        }
    };

    tracing::info!("Application started");
    let result = runtime.run(cancel).await;
    match &result {
        Ok(()) => tracing::info!("Application stopped"),
        Err(e) => tracing::error!(error = %e, "Application stopped with error"),
    }
    result
}

/// Process exit code for a run result: success is 0, anything else 1.
pub fn exit_code(result: &Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "exiting with failure");
            ExitCode::FAILURE
        }
    }
}
