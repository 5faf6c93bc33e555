//! Kafka consumer-group runtime for the queue application flavor.
//!
//! Each [`TopicBinding`] pairs a topic with a processor and a delivery mode.
//! [`KafkaRuntime`] joins the group and runs one ordered
//! [`worker::PartitionWorker`] per assigned partition:
//!
//! ```no_run
//! use humus::queue::{App, Processor};
//! use humus_kafka::{KafkaConfig, KafkaRuntime, Record, TopicBinding};
//!
//! struct PrintOrder;
//!
//! #[async_trait::async_trait]
//! impl Processor<Record> for PrintOrder {
//!     async fn process(&self, record: &Record) -> anyhow::Result<()> {
//!         tracing::info!(offset = record.offset, payload = ?record.payload_str(), "order");
//!         Ok(())
//!     }
//! }
//!
//! # fn build() -> anyhow::Result<App<KafkaRuntime>> {
//! let runtime = KafkaRuntime::new(
//!     KafkaConfig::new(["localhost:9092"], "orders-service"),
//!     [TopicBinding::at_least_once("orders", PrintOrder)],
//! )?;
//! Ok(App::new(runtime))
//! # }
//! ```

mod binding;
mod commit;
mod config;
mod dispatch;
mod record;
mod runtime;
pub mod worker;

pub use binding::{Delivery, TopicBinding};
pub use commit::{KafkaCommitter, OffsetCommitter};
pub use config::{AutoOffsetReset, KafkaConfig, KafkaTlsConfig};
pub use record::Record;
pub use runtime::{KafkaRuntime, KafkaRuntimeError};
