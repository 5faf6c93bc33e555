//! gRPC application flavor.
//!
//! Services are registered on an [`Api`]; those registered with a monitor
//! report through the standard `grpc.health.v1.Health` service, refreshed by
//! a background poller while the [`App`] runs.

mod api;
mod app;
pub mod health;

pub use api::{Api, ApiError, BuiltApi};
pub use app::{configured, App, GrpcConfig};
pub use health::{HealthPoller, DEFAULT_POLL_INTERVAL};
