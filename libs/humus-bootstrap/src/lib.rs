pub mod config;
pub mod logging;
pub mod signals;
pub mod telemetry;

pub use config::*;
pub use logging::*;
pub use signals::*;
