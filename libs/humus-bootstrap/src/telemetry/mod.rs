//! OpenTelemetry providers for traces, metrics and logs.
//!
//! [`init_telemetry`] builds the configured providers and registers them
//! globally; [`Telemetry::layers`] turns them into `tracing` layers that the
//! logging initializer installs next to the console/file sinks.

mod channels;
mod filter;
mod init;

pub use channels::ChannelCache;
pub use filter::LevelTable;
pub use init::{init_telemetry, Telemetry};
