use std::sync::Arc;

use log::{debug, warn};

use crate::kafka::broker::MetadataService;
use crate::kafka::error::BrokerError;
use crate::kafka::types::{TopicPartition, EARLIEST_OFFSET, LATEST_OFFSET};

/// Turns special offsets into concrete ones by asking the broker for the
/// partition bounds. Every call is scoped to a single partition.
#[derive(Clone)]
pub struct OffsetResolver {
    metadata: Arc<dyn MetadataService>,
}

impl OffsetResolver {
    pub fn new(metadata: Arc<dyn MetadataService>) -> Self {
        Self { metadata }
    }

    /// Starting point for a partition the group never committed.
    pub async fn resolve_initial(
        &self,
        topic_partition: &TopicPartition,
        from_beginning: bool,
    ) -> Result<i64, BrokerError> {
        let special = if from_beginning { EARLIEST_OFFSET } else { LATEST_OFFSET };
        let offset = self.resolve(topic_partition, special).await?;
        debug!(
            "Resolved initial offset for {} to {} (from_beginning={})",
            topic_partition, offset, from_beginning
        );
        Ok(offset)
    }

    /// Recovery after the broker rejected a fetch as out of range: always the
    /// earliest retained offset.
    pub async fn resolve_out_of_range(&self, topic_partition: &TopicPartition) -> Result<i64, BrokerError> {
        let offset = self.resolve(topic_partition, EARLIEST_OFFSET).await?;
        warn!("Offset out of range for {}, resetting to {}", topic_partition, offset);
        Ok(offset)
    }

    /// Concrete offsets pass through untouched.
    pub async fn resolve(&self, topic_partition: &TopicPartition, offset: i64) -> Result<i64, BrokerError> {
        match offset {
            EARLIEST_OFFSET => self.metadata.earliest_offset(topic_partition).await,
            LATEST_OFFSET => self.metadata.latest_offset(topic_partition).await,
            offset => Ok(offset),
        }
    }
}
