use anyhow::Result;
use axum::Router;
use futures::StreamExt;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};

use super::listener::{Connection, Listener};

/// Connection-level limits for [`serve_http`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpServerConfig {
    /// Budget for receiving the request body.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub read_header_timeout: Duration,
    /// Budget for producing the response.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// A connection with no request in flight for this long is closed.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    pub max_header_bytes: usize,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            read_header_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            max_header_bytes: 1 << 20,
        }
    }
}

/// Serves `router` on `listener` until `cancel` fires, then shuts every
/// connection down gracefully and waits for in-flight requests.
pub async fn serve_http(
    listener: Listener,
    router: Router,
    cfg: &HttpServerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, tls = listener.is_tls(), "HTTP server listening");

    #[allow(deprecated)]
    let router = router
        .layer(TimeoutLayer::new(cfg.write_timeout))
        .layer(RequestBodyTimeoutLayer::new(cfg.read_timeout));

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(cfg.read_header_timeout)
        .max_buf_size(cfg.max_header_bytes);
    builder.http2().timer(TokioTimer::new());

    let tracker = TaskTracker::new();
    let mut incoming = listener.incoming(cancel.clone());

    loop {
        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = incoming.next() => match next {
                Some(Ok(conn)) => conn,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "dropping connection");
                    continue;
                }
                None => break,
            },
        };

        tracker.spawn(serve_connection(
            conn,
            router.clone(),
            builder.clone(),
            cfg.idle_timeout,
            cancel.clone(),
        ));
    }

    tracker.close();
    tracing::info!(%addr, open = tracker.len(), "HTTP server draining connections");
    tracker.wait().await;
    tracing::info!(%addr, "HTTP server stopped");
    Ok(())
}

async fn serve_connection(
    conn: Connection,
    router: Router,
    builder: auto::Builder<TokioExecutor>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let peer = conn.peer_addr().ok();
    let activity = Arc::new(Activity::new());

    let tracked = activity.clone();
    let service = hyper::service::service_fn(move |req: hyper::Request<Incoming>| {
        let router = router.clone();
        let guard = tracked.begin();
        async move {
            let response = router.oneshot(req).await;
            drop(guard);
            response
        }
    });

    let connection = builder.serve_connection_with_upgrades(TokioIo::new(conn), service);
    tokio::pin!(connection);

    let mut closing = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(?peer, error = %e, "connection ended with error");
                }
                return;
            }
            _ = cancel.cancelled(), if !closing => {
                closing = true;
                connection.as_mut().graceful_shutdown();
            }
            _ = activity.idle_for(idle_timeout), if !closing => {
                tracing::debug!(?peer, "closing idle connection");
                closing = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

/// Per-connection request accounting for the idle watchdog.
struct Activity {
    in_flight: AtomicUsize,
    last: parking_lot::Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            last: parking_lot::Mutex::new(Instant::now()),
        }
    }

    fn begin(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Instant::now();
        InFlight(self.clone())
    }

    /// Resolves once no request has been in flight for `idle`.
    async fn idle_for(&self, idle: Duration) {
        loop {
            if self.in_flight.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(idle).await;
                continue;
            }
            let deadline = *self.last.lock() + idle;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

struct InFlight(Arc<Activity>);

impl Drop for InFlight {
    fn drop(&mut self) {
        *self.0.last.lock() = Instant::now();
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    type Running = (
        std::net::SocketAddr,
        CancellationToken,
        tokio::task::JoinHandle<Result<()>>,
    );

    async fn start(router: Router, cfg: HttpServerConfig) -> Running {
        let listener = Listener::tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { serve_http(listener, router, &cfg, token).await });
        (addr, cancel, handle)
    }

    async fn get_once(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[test]
    fn defaults_match_documented_limits() {
        let cfg = HttpServerConfig::default();
        assert_eq!(cfg.read_timeout, Duration::from_secs(5));
        assert_eq!(cfg.read_header_timeout, Duration::from_secs(2));
        assert_eq!(cfg.write_timeout, Duration::from_secs(10));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(120));
        assert_eq!(cfg.max_header_bytes, 1024 * 1024);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let cfg: HttpServerConfig = serde_yaml::from_str("idle_timeout: 30s\n").unwrap();
        assert_eq!(cfg.idle_timeout, Duration::from_secs(30));
        assert_eq!(cfg.write_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn serves_until_cancelled() {
        let router = Router::new().route("/hello", get(|| async { "world" }));
        let (addr, cancel, handle) = start(router, HttpServerConfig::default()).await;

        let response = get_once(addr, "/hello").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("world"));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn in_flight_request_finishes_after_cancel() {
        let router = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                "done"
            }),
        );
        let (addr, cancel, handle) = start(router, HttpServerConfig::default()).await;

        let client = tokio::spawn(async move { get_once(addr, "/slow").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let response = client.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("done"));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_keep_alive_connection_is_closed() {
        let router = Router::new().route("/", get(|| async { "ok" }));
        let cfg = HttpServerConfig {
            idle_timeout: Duration::from_millis(100),
            ..HttpServerConfig::default()
        };
        let (addr, cancel, handle) = start(router, cfg).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n")
            .await
            .unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    return seen;
                }
                seen.extend_from_slice(&buf[..n]);
            }
        })
        .await
        .expect("idle connection was not closed");

        let text = String::from_utf8(closed).unwrap();
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.ends_with("ok"));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn slow_handler_hits_write_timeout() {
        let router = Router::new().route(
            "/stuck",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let cfg = HttpServerConfig {
            write_timeout: Duration::from_millis(100),
            ..HttpServerConfig::default()
        };
        let (addr, cancel, handle) = start(router, cfg).await;

        let response = get_once(addr, "/stuck").await;
        assert!(response.starts_with("HTTP/1.1 408"), "{response}");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
