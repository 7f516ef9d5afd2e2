use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::kafka::error::BrokerError;
use crate::kafka::types::{FetchedBatch, TopicPartition};

/// Assignment changes pushed by the group protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentEvent {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
}

/// Group membership (join/sync/heartbeat) as seen by the fetch loop.
#[async_trait]
pub trait GroupMembership: Send + Sync {
    /// Join the group and return the initial assignment.
    async fn join(&self, group_id: &str) -> Result<Vec<TopicPartition>, BrokerError>;

    fn has_joined_at_least_once(&self) -> bool;

    /// Next pending assignment change, if any. Never blocks.
    fn poll_event(&self) -> Option<AssignmentEvent>;
}

#[async_trait]
pub trait FetchService: Send + Sync {
    async fn fetch(&self, topic_partition: &TopicPartition, offset: i64) -> Result<FetchedBatch, BrokerError>;
}

#[async_trait]
pub trait MetadataService: Send + Sync {
    async fn earliest_offset(&self, topic_partition: &TopicPartition) -> Result<i64, BrokerError>;

    /// High watermark: the offset the next produced record will get.
    async fn latest_offset(&self, topic_partition: &TopicPartition) -> Result<i64, BrokerError>;
}

#[async_trait]
pub trait CommitService: Send + Sync {
    async fn commit(&self, group_id: &str, offsets: &IndexMap<TopicPartition, i64>) -> Result<(), BrokerError>;

    /// Committed offsets for every partition of `topic`; `None` when the group
    /// never committed that partition.
    async fn fetch_committed_offsets(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<HashMap<TopicPartition, Option<i64>>, BrokerError>;
}

/// The collaborators a consumer talks to, bundled so they travel together.
#[derive(Clone)]
pub struct BrokerServices {
    pub membership: Arc<dyn GroupMembership>,
    pub fetcher: Arc<dyn FetchService>,
    pub metadata: Arc<dyn MetadataService>,
    pub commits: Arc<dyn CommitService>,
}

impl BrokerServices {
    /// Wire every broker-facing service to one backend.
    pub fn from_broker<B>(broker: Arc<B>, membership: Arc<dyn GroupMembership>) -> Self
    where
        B: FetchService + MetadataService + CommitService + 'static,
    {
        Self {
            membership,
            fetcher: broker.clone(),
            metadata: broker.clone(),
            commits: broker,
        }
    }
}
