use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Special offset resolved to the partition's log start.
pub const EARLIEST_OFFSET: i64 = -2;
/// Special offset resolved to the partition's high watermark.
pub const LATEST_OFFSET: i64 = -1;
/// What the broker reports for a group that never committed a partition.
pub const NO_COMMITTED_OFFSET: i64 = -1;

/// Representation of a topic partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// A single record as stored by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub timestamp: DateTime<Utc>,
    pub headers: IndexMap<String, Bytes>,
}

impl Record {
    pub fn new(offset: i64, key: Option<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            offset,
            key,
            value,
            timestamp: Utc::now(),
            headers: IndexMap::new(),
        }
    }
}

/// Records returned by one fetch, in broker order.
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    pub records: Vec<Record>,
    pub high_watermark: i64,
}

impl FetchedBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Message as handed to `eachMessage`. Offsets and timestamps are decimal
/// strings so callers never lose precision on 64-bit values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KafkaMessage {
    pub offset: String,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub timestamp: String,
    pub headers: IndexMap<String, Bytes>,
}

impl From<&Record> for KafkaMessage {
    fn from(record: &Record) -> Self {
        Self {
            offset: record.offset.to_string(),
            key: record.key.clone(),
            value: record.value.clone(),
            timestamp: record.timestamp.timestamp_millis().to_string(),
            headers: record.headers.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EachMessagePayload {
    pub topic: String,
    pub partition: i32,
    pub message: KafkaMessage,
}

impl EachMessagePayload {
    pub fn new(topic_partition: &TopicPartition, record: &Record) -> Self {
        Self {
            topic: topic_partition.topic.clone(),
            partition: topic_partition.partition,
            message: KafkaMessage::from(record),
        }
    }

    /// The record offset parsed back from its wire rendering.
    pub fn offset(&self) -> i64 {
        self.message.offset.parse().unwrap_or(NO_COMMITTED_OFFSET)
    }
}
