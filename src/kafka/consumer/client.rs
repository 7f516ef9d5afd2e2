use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Result};
use dashmap::DashMap;
use indexmap::IndexMap;
use log::info;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use super::commit::CommitScheduler;
use super::cursor::Position;
use super::events::ConsumerEvent;
use super::handler::MessageHandler;
use super::runner::{ConsumerRunner, RunnerParts};
use super::seek::{SeekRegistry, SeekRequest};
use crate::kafka::broker::BrokerServices;
use crate::kafka::config::{ConsumerConfig, RunConfig};
use crate::kafka::error::{BrokerError, CommitError, SeekError};
use crate::kafka::types::{TopicPartition, NO_COMMITTED_OFFSET};

const EVENT_CHANNEL_SIZE: usize = 1_024;

struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

/// A consumer group member. `seek` may be called from anywhere once `run` has
/// joined the group; everything else about reading is driven by the fetch
/// loop that `run` starts.
pub struct Consumer {
    config: ConsumerConfig,
    services: BrokerServices,
    registry: Arc<SeekRegistry>,
    positions: Arc<DashMap<TopicPartition, Position>>,
    events: broadcast::Sender<ConsumerEvent>,
    running: Mutex<Option<Running>>,
}

impl Consumer {
    pub fn new(config: ConsumerConfig, services: BrokerServices) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            config,
            services,
            registry: Arc::new(SeekRegistry::new()),
            positions: Arc::new(DashMap::new()),
            events,
            running: Mutex::new(None),
        }
    }

    pub fn events(&self) -> BroadcastStream<ConsumerEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Read `topic`/`partition` from `offset` on the next fetch cycle. Later
    /// seeks for the same partition replace earlier ones.
    pub fn seek(&self, topic: &str, partition: i32, offset: &str) -> Result<(), SeekError> {
        self.registry.record(SeekRequest::new(Some(topic), partition, offset)?)
    }

    /// Same as [`Consumer::seek`] for an untyped `{topic, partition, offset}`
    /// object.
    pub fn seek_value(&self, request: &Value) -> Result<(), SeekError> {
        self.registry.record(SeekRequest::from_value(request)?)
    }

    /// Join the group and start the fetch loop. Returns once membership is
    /// established; records flow to `handler` in the background until
    /// [`Consumer::stop`].
    pub async fn run<H>(&self, run: RunConfig, handler: H) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        if self.is_running() {
            bail!("consumer for group {} is already running", self.config.group_id);
        }

        let group_id = self.config.group_id.clone();
        let assigned = self.services.membership.join(&group_id).await?;
        if self.services.membership.has_joined_at_least_once() {
            self.registry.mark_initialized();
        }
        info!("Joined group {} with {} partitions", group_id, assigned.len());
        let _ = self.events.send(ConsumerEvent::GroupJoin {
            group_id: group_id.clone(),
            assigned: assigned.clone(),
        });

        let scheduler = if run.auto_commit {
            Some(
                CommitScheduler::spawn(
                    group_id,
                    self.services.commits.clone(),
                    &run,
                    self.events.clone(),
                )
                .await?,
            )
        } else {
            None
        };

        let runner = ConsumerRunner::new(RunnerParts {
            config: self.config.clone(),
            auto_commit: run.auto_commit,
            services: self.services.clone(),
            registry: self.registry.clone(),
            handler: Arc::new(handler),
            scheduler,
            positions: self.positions.clone(),
            events: self.events.clone(),
        });

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(runner.run(assigned, stop_rx));
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(Running { stop, task });
        Ok(())
    }

    /// Stop the fetch loop. In-flight fetches are abandoned, consumed offsets
    /// are committed when auto-commit is on.
    pub async fn stop(&self) -> Result<()> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return Ok(());
        };

        let _ = running.stop.send(true);
        running.task.await??;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Fetch and consumed offsets of every partition currently assigned.
    pub fn positions(&self) -> BTreeMap<TopicPartition, Position> {
        self.positions
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Commit explicit offsets for the group, bypassing the auto-commit
    /// schedule.
    pub async fn commit_offsets(&self, offsets: &[(TopicPartition, i64)]) -> Result<(), CommitError> {
        let mut batch = IndexMap::new();
        for (tp, offset) in offsets {
            if *offset < 0 {
                return Err(CommitError::InvalidOffset {
                    topic_partition: tp.clone(),
                    offset: *offset,
                });
            }
            batch.insert(tp.clone(), *offset);
        }
        self.services
            .commits
            .commit(&self.config.group_id, &batch)
            .await?;
        let _ = self.events.send(ConsumerEvent::CommitOffsets {
            offsets: batch.into_iter().collect(),
        });
        Ok(())
    }

    /// The group's committed offsets for `topic`, with "never committed"
    /// rendered as `-1`.
    pub async fn committed_offsets(&self, topic: &str) -> Result<Vec<(TopicPartition, i64)>, BrokerError> {
        let committed = self
            .services
            .commits
            .fetch_committed_offsets(&self.config.group_id, topic)
            .await?;
        let mut offsets: Vec<(TopicPartition, i64)> = committed
            .into_iter()
            .map(|(tp, offset)| (tp, offset.unwrap_or(NO_COMMITTED_OFFSET)))
            .collect();
        offsets.sort();
        Ok(offsets)
    }
}
