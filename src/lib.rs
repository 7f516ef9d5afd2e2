pub mod kafka;

pub use kafka::{
    BrokerError, CommitError, Consumer, ConsumerConfig, ConsumerEvent, EachMessagePayload,
    KafkaMessage, MessageHandler, RetryConfig, RunConfig, SeekError, TopicPartition,
};
