use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;
use tonic::transport::Server;
use tower_http::trace::TraceLayer;

use super::listener::Listener;
use super::trace::{GrpcSpan, RequestMetricsLayer};

/// Serves `routes` on `listener` until `cancel` fires, letting in-flight
/// calls finish.
pub async fn serve_grpc(listener: Listener, routes: Routes, cancel: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, tls = listener.is_tls(), "gRPC server listening");

    let incoming = listener.incoming(cancel.clone());
    Server::builder()
        .layer(TraceLayer::new_for_grpc().make_span_with(GrpcSpan))
        .layer(RequestMetricsLayer::grpc())
        .add_routes(routes)
        .serve_with_incoming_shutdown(incoming, cancel.cancelled_owned())
        .await
        .with_context(|| format!("gRPC server on {addr} failed"))?;

    tracing::info!(%addr, "gRPC server stopped");
    Ok(())
}
