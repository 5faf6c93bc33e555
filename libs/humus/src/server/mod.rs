//! Listeners and serve loops shared by the REST and gRPC flavors.

mod grpc;
mod http;
mod listener;
mod tls;
mod trace;

pub use grpc::serve_grpc;
pub use http::{serve_http, HttpServerConfig};
pub use listener::{Connection, Listener, ListenerConfig};
pub use tls::{PemSource, TlsConfig, TlsError, TlsVersion};
pub use trace::{set_remote_parent, GrpcSpan, RequestMetrics, RequestMetricsLayer};
