use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use indexmap::IndexMap;
use kafka_protocol::ResponseError;
use log::{debug, info};

use super::services::{AssignmentEvent, CommitService, FetchService, GroupMembership, MetadataService};
use crate::kafka::error::BrokerError;
use crate::kafka::types::{FetchedBatch, Record, TopicPartition};

const DEFAULT_MAX_BATCH_RECORDS: usize = 100;

#[derive(Debug, Default)]
struct PartitionLog {
    log_start: i64,
    records: Vec<Record>,
}

impl PartitionLog {
    fn high_watermark(&self) -> i64 {
        self.log_start + self.records.len() as i64
    }
}

/// Broker kept entirely in process memory: partition logs, committed offsets
/// per group, and injectable faults.
pub struct MemoryBroker {
    topics: DashMap<String, i32>,
    logs: DashMap<TopicPartition, PartitionLog>,
    committed: DashMap<(String, TopicPartition), i64>,
    fetch_faults: DashMap<TopicPartition, VecDeque<BrokerError>>,
    commit_faults: Mutex<VecDeque<BrokerError>>,
    offset_fetch_faults: Mutex<VecDeque<BrokerError>>,
    fetch_requests: AtomicUsize,
    max_batch_records: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_RECORDS)
    }
}

impl MemoryBroker {
    pub fn new(max_batch_records: usize) -> Self {
        Self {
            topics: DashMap::new(),
            logs: DashMap::new(),
            committed: DashMap::new(),
            fetch_faults: DashMap::new(),
            commit_faults: Mutex::new(VecDeque::new()),
            offset_fetch_faults: Mutex::new(VecDeque::new()),
            fetch_requests: AtomicUsize::new(0),
            max_batch_records: max_batch_records.max(1),
        }
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        self.topics.insert(topic.to_string(), partitions);
        for partition in 0..partitions {
            self.logs
                .entry(TopicPartition::new(topic, partition))
                .or_default();
        }
        info!("Created topic {} with {} partitions", topic, partitions);
    }

    /// Append a record and return its offset.
    pub fn produce(
        &self,
        topic_partition: &TopicPartition,
        key: Option<&str>,
        value: &str,
    ) -> Result<i64, BrokerError> {
        let mut log = self
            .logs
            .get_mut(topic_partition)
            .ok_or_else(|| BrokerError::response(ResponseError::UnknownTopicOrPartition))?;
        let offset = log.high_watermark();
        log.records.push(Record::new(
            offset,
            key.map(|k| Bytes::copy_from_slice(k.as_bytes())),
            Some(Bytes::copy_from_slice(value.as_bytes())),
        ));
        debug!("Appended offset {} to {}", offset, topic_partition);
        Ok(offset)
    }

    /// Drop every record below `offset`, as retention would.
    pub fn truncate_before(&self, topic_partition: &TopicPartition, offset: i64) {
        if let Some(mut log) = self.logs.get_mut(topic_partition) {
            let cut = (offset - log.log_start).clamp(0, log.records.len() as i64) as usize;
            log.records.drain(..cut);
            log.log_start += cut as i64;
            info!("Truncated {} to start at {}", topic_partition, log.log_start);
        }
    }

    pub fn committed_offset(&self, group_id: &str, topic_partition: &TopicPartition) -> Option<i64> {
        self.committed
            .get(&(group_id.to_string(), topic_partition.clone()))
            .map(|offset| *offset)
    }

    /// Make the next fetch for `topic_partition` fail with `error`.
    pub fn fail_next_fetch(&self, topic_partition: &TopicPartition, error: BrokerError) {
        self.fetch_faults
            .entry(topic_partition.clone())
            .or_default()
            .push_back(error);
    }

    pub fn fail_next_commit(&self, error: BrokerError) {
        self.commit_faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Make the next committed-offset lookup fail with `error`.
    pub fn fail_next_offset_fetch(&self, error: BrokerError) {
        self.offset_fetch_faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    pub fn fetch_request_count(&self) -> usize {
        self.fetch_requests.load(Ordering::Relaxed)
    }

    fn next_fetch_fault(&self, topic_partition: &TopicPartition) -> Option<BrokerError> {
        self.fetch_faults
            .get_mut(topic_partition)
            .and_then(|mut faults| faults.pop_front())
    }

    fn bounds(&self, topic_partition: &TopicPartition) -> Result<(i64, i64), BrokerError> {
        self.logs
            .get(topic_partition)
            .map(|log| (log.log_start, log.high_watermark()))
            .ok_or_else(|| BrokerError::response(ResponseError::UnknownTopicOrPartition))
    }
}

#[async_trait]
impl FetchService for MemoryBroker {
    async fn fetch(&self, topic_partition: &TopicPartition, offset: i64) -> Result<FetchedBatch, BrokerError> {
        self.fetch_requests.fetch_add(1, Ordering::Relaxed);
        if let Some(error) = self.next_fetch_fault(topic_partition) {
            return Err(error);
        }

        let log = self
            .logs
            .get(topic_partition)
            .ok_or_else(|| BrokerError::response(ResponseError::UnknownTopicOrPartition))?;
        let high_watermark = log.high_watermark();
        if offset < log.log_start || offset > high_watermark {
            return Err(BrokerError::OffsetOutOfRange {
                topic_partition: topic_partition.clone(),
                offset,
            });
        }

        let start = (offset - log.log_start) as usize;
        let end = (start + self.max_batch_records).min(log.records.len());
        Ok(FetchedBatch {
            records: log.records[start..end].to_vec(),
            high_watermark,
        })
    }
}

#[async_trait]
impl MetadataService for MemoryBroker {
    async fn earliest_offset(&self, topic_partition: &TopicPartition) -> Result<i64, BrokerError> {
        self.bounds(topic_partition).map(|(earliest, _)| earliest)
    }

    async fn latest_offset(&self, topic_partition: &TopicPartition) -> Result<i64, BrokerError> {
        self.bounds(topic_partition).map(|(_, latest)| latest)
    }
}

#[async_trait]
impl CommitService for MemoryBroker {
    async fn commit(&self, group_id: &str, offsets: &IndexMap<TopicPartition, i64>) -> Result<(), BrokerError> {
        let fault = self
            .commit_faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(error) = fault {
            return Err(error);
        }

        if offsets.keys().any(|tp| !self.logs.contains_key(tp)) {
            return Err(BrokerError::response(ResponseError::UnknownTopicOrPartition));
        }
        for (topic_partition, offset) in offsets {
            self.committed
                .insert((group_id.to_string(), topic_partition.clone()), *offset);
            debug!("Committed offset {} for group={}, {}", offset, group_id, topic_partition);
        }
        Ok(())
    }

    async fn fetch_committed_offsets(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<HashMap<TopicPartition, Option<i64>>, BrokerError> {
        let fault = self
            .offset_fetch_faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(error) = fault {
            return Err(error);
        }

        let partitions = *self
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::response(ResponseError::UnknownTopicOrPartition))?;

        Ok((0..partitions)
            .map(|partition| {
                let topic_partition = TopicPartition::new(topic, partition);
                let offset = self.committed_offset(group_id, &topic_partition);
                (topic_partition, offset)
            })
            .collect())
    }
}

/// Group membership with a fixed initial assignment and manually pushed
/// rebalance events.
pub struct MemoryGroup {
    initial: Vec<TopicPartition>,
    joined: AtomicBool,
    events: Mutex<VecDeque<AssignmentEvent>>,
}

impl MemoryGroup {
    pub fn new(initial: Vec<TopicPartition>) -> Self {
        Self {
            initial,
            joined: AtomicBool::new(false),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn assign(&self, partitions: Vec<TopicPartition>) {
        self.push(AssignmentEvent::Assigned(partitions));
    }

    pub fn revoke(&self, partitions: Vec<TopicPartition>) {
        self.push(AssignmentEvent::Revoked(partitions));
    }

    fn push(&self, event: AssignmentEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);
    }
}

#[async_trait]
impl GroupMembership for MemoryGroup {
    async fn join(&self, group_id: &str) -> Result<Vec<TopicPartition>, BrokerError> {
        self.joined.store(true, Ordering::SeqCst);
        info!("Member joined group {} with {} partitions", group_id, self.initial.len());
        Ok(self.initial.clone())
    }

    fn has_joined_at_least_once(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    fn poll_event(&self) -> Option<AssignmentEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}
