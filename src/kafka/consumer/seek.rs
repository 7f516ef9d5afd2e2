use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use log::debug;
use serde_json::Value;

use crate::kafka::error::SeekError;
use crate::kafka::types::TopicPartition;

/// A validated request to read `topic_partition` from `offset` next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekRequest {
    pub topic_partition: TopicPartition,
    pub offset: i64,
}

impl SeekRequest {
    /// Typed entry point. The offset is a decimal string, the same rendering
    /// delivered messages use.
    pub fn new(topic: Option<&str>, partition: i32, offset: &str) -> Result<Self, SeekError> {
        let topic = validate_topic(topic)?;
        if partition < 0 {
            return Err(SeekError::InvalidPartition(partition.to_string()));
        }
        let offset = offset
            .trim()
            .parse::<i64>()
            .map_err(|_| SeekError::InvalidOffset(offset.to_string()))?;
        Self::checked(topic, partition, offset)
    }

    /// Untyped entry point for `{topic, partition, offset}` objects, e.g. from a
    /// JSON control channel. The partition must be a JSON integer; the offset
    /// may be an integer or a decimal string.
    pub fn from_value(value: &Value) -> Result<Self, SeekError> {
        let topic = validate_topic(value.get("topic").and_then(Value::as_str))
            .map_err(|_| SeekError::InvalidTopic(render(value.get("topic"))))?;

        let partition = value
            .get("partition")
            .and_then(Value::as_i64)
            .and_then(|p| i32::try_from(p).ok())
            .filter(|p| *p >= 0)
            .ok_or_else(|| SeekError::InvalidPartition(render(value.get("partition"))))?;

        let offset = match value.get("offset") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .ok_or_else(|| SeekError::InvalidOffset(render(value.get("offset"))))?;

        Self::checked(topic, partition, offset)
    }

    fn checked(topic: &str, partition: i32, offset: i64) -> Result<Self, SeekError> {
        // Negative offsets only ever come from the resolver's special values.
        if offset < 0 {
            return Err(SeekError::NegativeOffset);
        }
        Ok(Self {
            topic_partition: TopicPartition::new(topic, partition),
            offset,
        })
    }
}

fn validate_topic(topic: Option<&str>) -> Result<&str, SeekError> {
    match topic {
        Some(t) if !t.is_empty() => Ok(t),
        Some(t) => Err(SeekError::InvalidTopic(format!("{t:?}"))),
        None => Err(SeekError::InvalidTopic("null".to_string())),
    }
}

fn render(value: Option<&Value>) -> String {
    value.map_or_else(|| "undefined".to_string(), Value::to_string)
}

/// At most one pending seek per partition. A later seek overwrites an earlier
/// one; the fetch loop takes each entry exactly once.
#[derive(Debug, Default)]
pub struct SeekRegistry {
    pending: DashMap<TopicPartition, SeekRequest>,
    initialized: AtomicBool,
}

impl SeekRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set once group membership has been established; never cleared.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn record(&self, seek: SeekRequest) -> Result<(), SeekError> {
        if !self.is_initialized() {
            return Err(SeekError::NotInitialized);
        }
        debug!("Pending seek for {} to offset {}", seek.topic_partition, seek.offset);
        self.pending.insert(seek.topic_partition.clone(), seek);
        Ok(())
    }

    pub fn take_pending(&self, topic_partition: &TopicPartition) -> Option<SeekRequest> {
        self.pending.remove(topic_partition).map(|(_, seek)| seek)
    }

    pub fn has_pending(&self, topic_partition: &TopicPartition) -> bool {
        self.pending.contains_key(topic_partition)
    }

    pub fn discard(&self, topic_partition: &TopicPartition) {
        self.pending.remove(topic_partition);
    }
}
