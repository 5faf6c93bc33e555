use std::fmt;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// The OS signal that ended the wait.
///
/// SIGKILL cannot be observed by a process and is therefore absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
///
/// A handler that fails to install is logged and ignored, so the other
/// signal still ends the wait.
pub async fn wait_for_shutdown() -> ShutdownSignal {
    let interrupt = async {
        match signal::ctrl_c().await {
            Ok(()) => ShutdownSignal::Interrupt,
            Err(e) => {
                tracing::error!(%e, "Failed to install SIGINT handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                ShutdownSignal::Terminate
            }
            Err(e) => {
                tracing::error!(%e, "Failed to install SIGTERM handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<ShutdownSignal>();

    let signal = tokio::select! {
        s = interrupt => s,
        s = terminate => s,
    };
    tracing::info!(%signal, "Shutdown signal received, initiating graceful shutdown");
    signal
}

/// Returns a child of `parent` that is cancelled on the first shutdown
/// signal. The watcher task exits early if `parent` is cancelled first.
pub fn cancel_on_shutdown(parent: &CancellationToken) -> CancellationToken {
    let token = parent.child_token();
    let watched = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_shutdown() => watched.cancel(),
            _ = watched.cancelled() => {}
        }
    });
    token
}
