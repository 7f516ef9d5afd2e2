use serde::Serialize;

use crate::kafka::types::TopicPartition;

/// Instrumentation emitted by a running consumer. Broker failures only
/// reach user code through this channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsumerEvent {
    GroupJoin {
        group_id: String,
        assigned: Vec<TopicPartition>,
    },
    Seek {
        topic_partition: TopicPartition,
        offset: i64,
    },
    OffsetReset {
        topic_partition: TopicPartition,
        from: i64,
        to: i64,
    },
    CommitOffsets {
        offsets: Vec<(TopicPartition, i64)>,
    },
    FetchRetry {
        topic_partition: TopicPartition,
        attempt: u32,
        error: String,
    },
    /// A partition exhausted its retry budget. The consumer keeps running and
    /// starts a fresh budget for it.
    Crash {
        topic_partition: TopicPartition,
        error: String,
    },
    Stop,
}
