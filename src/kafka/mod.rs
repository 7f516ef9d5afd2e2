pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod types;

pub use config::{ConsumerConfig, RetryConfig, RunConfig};
pub use consumer::{Consumer, ConsumerEvent, MessageHandler};
pub use error::{BrokerError, CommitError, SeekError};
pub use types::{EachMessagePayload, KafkaMessage, TopicPartition};
