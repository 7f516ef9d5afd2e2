//! Error types for the consumer engine.

use kafka_protocol::ResponseError;
use thiserror::Error;

use super::types::TopicPartition;

/// Rejections raised synchronously by `seek`. These are programmer errors and
/// are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeekError {
    #[error("Invalid topic {0}")]
    InvalidTopic(String),

    #[error("Invalid partition, expected a number received {0}")]
    InvalidPartition(String),

    #[error("Invalid offset, expected a long received {0}")]
    InvalidOffset(String),

    #[error("Offset must not be a negative number")]
    NegativeOffset,

    #[error("Consumer group was not initialized, consumer run must be called first")]
    NotInitialized,
}

/// Failures reported by the broker collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("offset {offset} is out of range for {topic_partition}")]
    OffsetOutOfRange {
        topic_partition: TopicPartition,
        offset: i64,
    },

    #[error("broker returned {} (code {code})", describe_code(.code))]
    Response { code: i16 },

    #[error("connection error: {0}")]
    Connection(String),
}

impl BrokerError {
    pub fn response(error: ResponseError) -> Self {
        Self::Response { code: error.code() }
    }

    pub fn is_offset_out_of_range(&self) -> bool {
        matches!(self, Self::OffsetOutOfRange { .. })
    }
}

fn describe_code(code: &i16) -> String {
    ResponseError::try_from_code(*code)
        .map(|error| format!("{error:?}"))
        .unwrap_or_else(|| "UnknownServerError".to_string())
}

/// Offset commit failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("commit rejected: {0}")]
    Broker(#[from] BrokerError),

    #[error("cannot commit negative offset {offset} for {topic_partition}")]
    InvalidOffset {
        topic_partition: TopicPartition,
        offset: i64,
    },

    #[error("commit scheduler is not running")]
    SchedulerUnavailable,
}
