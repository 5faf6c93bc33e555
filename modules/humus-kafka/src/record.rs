use rdkafka::message::{Headers, Message};

/// An owned copy of a fetched Kafka message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Option<Vec<u8>>)>,
    /// Milliseconds since the Unix epoch, when the broker reported one.
    pub timestamp: Option<i64>,
}

impl Record {
    pub fn from_message<M: Message>(msg: &M) -> Self {
        let headers = msg
            .headers()
            .map(|hs| {
                hs.iter()
                    .map(|h| (h.key.to_owned(), h.value.map(<[u8]>::to_vec)))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            topic: msg.topic().to_owned(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(<[u8]>::to_vec),
            payload: msg.payload().map(<[u8]>::to_vec),
            headers,
            timestamp: msg.timestamp().to_millis(),
        }
    }

    /// Payload as UTF-8, if present and valid.
    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_deref().and_then(|p| std::str::from_utf8(p).ok())
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::{Header, OwnedHeaders, OwnedMessage, Timestamp};

    #[test]
    fn copies_message_fields() {
        let headers = OwnedHeaders::new().insert(Header {
            key: "trace",
            value: Some("abc"),
        });
        let msg = OwnedMessage::new(
            Some(b"{\"id\":1}".to_vec()),
            Some(b"k1".to_vec()),
            "orders".to_owned(),
            Timestamp::CreateTime(1_700_000_000_000),
            3,
            42,
            Some(headers),
        );

        let record = Record::from_message(&msg);
        assert_eq!(record.topic, "orders");
        assert_eq!(record.partition, 3);
        assert_eq!(record.offset, 42);
        assert_eq!(record.key.as_deref(), Some(&b"k1"[..]));
        assert_eq!(record.payload_str(), Some("{\"id\":1}"));
        assert_eq!(record.header("trace"), Some(&b"abc"[..]));
        assert_eq!(record.timestamp, Some(1_700_000_000_000));
    }
}
