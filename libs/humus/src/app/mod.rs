//! Application lifecycle: builders, runtimes, post-run hooks and the
//! signal-driven run driver shared by every application flavor.

mod builder;
mod configured;
mod hooks;
mod runner;

pub use builder::{bind, builder_fn, Bind, Builder, BuilderFn, Runtime};
pub use configured::{configured, Configured};
pub use hooks::{with_hooks, Hooks, HooksBuilder, WithHooks};
pub use runner::{exit_code, run, run_with_cancel};
