//! Application skeleton for long-running services and queue workers.
//!
//! [`app`] holds the builder/runtime lifecycle with post-run hooks,
//! [`health`] the monitor algebra behind readiness and liveness probes,
//! [`queue`] the delivery-semantics engine, and [`server`] the HTTP and
//! gRPC serve loops the flavor crates build on.

pub mod app;
pub mod errors;
pub mod health;
pub mod queue;
pub mod server;

pub use app::{run, Builder, Hooks, Runtime};
