//! Queue processing with pluggable delivery semantics.
//!
//! A queue step is a (consumer, processor, acknowledger) triple. The order in
//! which the step acknowledges relative to processing decides the guarantee:
//! [`AtMostOnce`] acknowledges first, [`AtLeastOnce`] acknowledges last.
//! [`process_queue`] drives a step until the queue ends, a step fails, or the
//! run is cancelled. [`App`] turns any [`QueueRuntime`] into an application
//! runtime.

mod app;
mod engine;

pub use app::{configured, App, ItemRuntime, QueueRuntime};
pub use engine::{
    is_end_of_queue, process_queue, Acknowledger, AtLeastOnce, AtMostOnce, ChannelConsumer,
    Consumer, EndOfQueue, ItemProcessor, Processor,
};
