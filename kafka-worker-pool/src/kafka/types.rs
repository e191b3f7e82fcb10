use std::fmt;

use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// Ordered record headers. Keys may repeat and values may be null, as on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    entries: Vec<(String, Option<Vec<u8>>)>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Option<Vec<u8>>) {
        self.entries.push((key.into(), value));
    }

    /// Value of the last header with this key
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&[u8]>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_owned_headers(&self) -> OwnedHeaders {
        self.entries
            .iter()
            .fold(OwnedHeaders::new_with_capacity(self.entries.len()), |headers, (key, value)| {
                headers.insert(Header {
                    key,
                    value: value.as_deref(),
                })
            })
    }
}

/// A record fetched from the broker, detached from the client's buffers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaRecord {
    partition: Partition,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    headers: MessageHeaders,
    timestamp: Option<i64>,
}

impl KafkaRecord {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: Vec<u8>,
        headers: MessageHeaders,
        timestamp: Option<i64>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            payload,
            headers,
            timestamp,
        }
    }

    pub fn from_message<M: Message>(message: &M) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                let mut owned = MessageHeaders::new();
                for header in headers.iter() {
                    owned.insert(header.key, header.value.map(<[u8]>::to_vec));
                }
                owned
            })
            .unwrap_or_default();

        Self {
            partition: Partition::new(message.topic(), message.partition()),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            headers,
            timestamp: message.timestamp().to_millis(),
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    /// Creation or log-append time in milliseconds since the epoch
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Running,
    Stopping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_get_returns_last_value_for_key() {
        let mut headers = MessageHeaders::new();
        headers.insert("trace", Some(b"first".to_vec()));
        headers.insert("empty", None);
        headers.insert("trace", Some(b"second".to_vec()));

        assert_eq!(headers.len(), 3);
        assert_eq!(headers.get("trace"), Some(&b"second"[..]));
        assert_eq!(headers.get("empty"), None);
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn test_headers_preserve_insertion_order() {
        let mut headers = MessageHeaders::new();
        headers.insert("b", Some(vec![2]));
        headers.insert("a", Some(vec![1]));

        let keys: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn test_record_from_owned_message() {
        use rdkafka::message::{OwnedMessage, Timestamp};

        let owned_headers = OwnedHeaders::new().insert(Header {
            key: "source",
            value: Some("tests"),
        });
        let message = OwnedMessage::new(
            Some(b"payload".to_vec()),
            Some(b"key".to_vec()),
            "events".to_string(),
            Timestamp::CreateTime(1_700_000_000_000),
            3,
            42,
            Some(owned_headers),
        );

        let record = KafkaRecord::from_message(&message);

        assert_eq!(record.partition(), &Partition::new("events", 3));
        assert_eq!(record.offset(), 42);
        assert_eq!(record.key(), Some(&b"key"[..]));
        assert_eq!(record.payload(), b"payload");
        assert_eq!(record.headers().get("source"), Some(&b"tests"[..]));
        assert_eq!(record.timestamp(), Some(1_700_000_000_000));
    }

    #[test]
    fn test_record_without_payload_has_empty_value() {
        use rdkafka::message::{OwnedMessage, Timestamp};

        let message = OwnedMessage::new(
            None,
            None,
            "events".to_string(),
            Timestamp::NotAvailable,
            0,
            7,
            None,
        );

        let record = KafkaRecord::from_message(&message);

        assert!(record.key().is_none());
        assert!(record.payload().is_empty());
        assert!(record.headers().is_empty());
        assert_eq!(record.timestamp(), None);
    }
}
