use humus::queue::Processor;
use std::fmt;
use std::sync::Arc;

use crate::record::Record;

/// Where acknowledgement sits relative to processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Commit, then process. A failed record is not redelivered.
    AtMostOnce,
    /// Process, then store the offset. A failed record is redelivered.
    AtLeastOnce,
}

/// A topic subscription and the processor that handles its records.
#[derive(Clone)]
pub struct TopicBinding {
    pub(crate) topic: String,
    pub(crate) delivery: Delivery,
    pub(crate) processor: Arc<dyn Processor<Record>>,
}

impl TopicBinding {
    pub fn at_most_once(topic: impl Into<String>, processor: impl Processor<Record> + 'static) -> Self {
        Self::new(topic, Delivery::AtMostOnce, processor)
    }

    pub fn at_least_once(topic: impl Into<String>, processor: impl Processor<Record> + 'static) -> Self {
        Self::new(topic, Delivery::AtLeastOnce, processor)
    }

    fn new(topic: impl Into<String>, delivery: Delivery, processor: impl Processor<Record> + 'static) -> Self {
        Self {
            topic: topic.into(),
            delivery,
            processor: Arc::new(processor),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn delivery(&self) -> Delivery {
        self.delivery
    }
}

impl fmt::Debug for TopicBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicBinding")
            .field("topic", &self.topic)
            .field("delivery", &self.delivery)
            .finish_non_exhaustive()
    }
}
