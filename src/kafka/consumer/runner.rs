use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use super::commit::CommitScheduler;
use super::cursor::{PartitionCursor, Position};
use super::events::ConsumerEvent;
use super::handler::MessageHandler;
use super::resolver::OffsetResolver;
use super::seek::SeekRegistry;
use crate::kafka::broker::{AssignmentEvent, BrokerServices, CommitService, FetchService};
use crate::kafka::config::ConsumerConfig;
use crate::kafka::error::BrokerError;
use crate::kafka::types::{EachMessagePayload, FetchedBatch, TopicPartition};

type Work = BoxFuture<'static, WorkResult>;

/// How a partition's unit of work starts.
#[derive(Debug, Clone, Copy)]
enum Start {
    At(i64),
    /// No position yet: the group's committed offset, else the initial offset.
    Initial,
    OutOfRange,
}

struct WorkResult {
    tp: TopicPartition,
    /// Assignment the work was issued under.
    epoch: u64,
    /// Offset produced by resolution, when the work started symbolically.
    resolved: Option<i64>,
    /// Offset the fetch was issued at; `None` if resolution failed.
    fetched_at: Option<i64>,
    outcome: Result<FetchedBatch, BrokerError>,
}

struct Backoff {
    attempts: u32,
    not_before: Instant,
}

/// Everything a unit of work needs from the broker side. Shared by all
/// in-flight work so none of it borrows the runner.
struct WorkContext {
    group_id: String,
    from_beginning: bool,
    resolver: OffsetResolver,
    fetcher: Arc<dyn FetchService>,
    commits: Arc<dyn CommitService>,
}

impl WorkContext {
    /// Where a freshly assigned partition starts. Only an answer of "no
    /// commit" from the broker falls back to `from_beginning`; a failed lookup
    /// is an error so the partition is retried rather than moved.
    async fn initial_offset(&self, tp: &TopicPartition) -> Result<i64, BrokerError> {
        let committed = self
            .commits
            .fetch_committed_offsets(&self.group_id, &tp.topic)
            .await?;
        match committed.get(tp).copied().flatten() {
            Some(offset) if offset >= 0 => {
                info!("Starting {} at committed offset {}", tp, offset);
                Ok(offset)
            }
            _ => {
                info!("No committed offset for {} in group {}", tp, self.group_id);
                self.resolver.resolve_initial(tp, self.from_beginning).await
            }
        }
    }
}

/// The fetch loop. Owns every partition cursor for the lifetime of a run.
pub(crate) struct ConsumerRunner {
    group_id: String,
    config: ConsumerConfig,
    auto_commit: bool,
    services: BrokerServices,
    context: Arc<WorkContext>,
    registry: Arc<SeekRegistry>,
    handler: Arc<dyn MessageHandler>,
    scheduler: Option<CommitScheduler>,
    cursors: BTreeMap<TopicPartition, PartitionCursor>,
    // assigned, no cursor yet
    unresolved: BTreeSet<TopicPartition>,
    // last fetch was rejected as out of range
    out_of_range: HashSet<TopicPartition>,
    backoff: HashMap<TopicPartition, Backoff>,
    // caught up; next fetch not before
    idle: HashMap<TopicPartition, Instant>,
    // at most one unit of work per partition
    in_flight: HashSet<TopicPartition>,
    epochs: HashMap<TopicPartition, u64>,
    next_epoch: u64,
    positions: Arc<DashMap<TopicPartition, Position>>,
    events: broadcast::Sender<ConsumerEvent>,
}

pub(crate) struct RunnerParts {
    pub config: ConsumerConfig,
    pub auto_commit: bool,
    pub services: BrokerServices,
    pub registry: Arc<SeekRegistry>,
    pub handler: Arc<dyn MessageHandler>,
    pub scheduler: Option<CommitScheduler>,
    pub positions: Arc<DashMap<TopicPartition, Position>>,
    pub events: broadcast::Sender<ConsumerEvent>,
}

impl ConsumerRunner {
    pub fn new(parts: RunnerParts) -> Self {
        let context = WorkContext {
            group_id: parts.config.group_id.clone(),
            from_beginning: parts.config.from_beginning,
            resolver: OffsetResolver::new(parts.services.metadata.clone()),
            fetcher: parts.services.fetcher.clone(),
            commits: parts.services.commits.clone(),
        };
        Self {
            group_id: parts.config.group_id.clone(),
            context: Arc::new(context),
            config: parts.config,
            auto_commit: parts.auto_commit,
            services: parts.services,
            registry: parts.registry,
            handler: parts.handler,
            scheduler: parts.scheduler,
            cursors: BTreeMap::new(),
            unresolved: BTreeSet::new(),
            out_of_range: HashSet::new(),
            backoff: HashMap::new(),
            idle: HashMap::new(),
            in_flight: HashSet::new(),
            epochs: HashMap::new(),
            next_epoch: 0,
            positions: parts.positions,
            events: parts.events,
        }
    }

    /// Each partition runs its own resolve-fetch-deliver cycle: as soon as one
    /// partition's result is applied its next unit of work is issued, whatever
    /// the other partitions are waiting on.
    pub async fn run(mut self, assigned: Vec<TopicPartition>, mut stop: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.assign(assigned);
        let mut inflight: FuturesUnordered<Work> = FuturesUnordered::new();

        loop {
            if *stop.borrow() {
                break;
            }
            self.apply_membership_events().await;
            self.schedule(&mut inflight);

            let wake = self.next_wake();
            tokio::select! {
                _ = stop.changed() => break,
                Some(result) = inflight.next(), if !inflight.is_empty() => {
                    self.in_flight.remove(&result.tp);
                    // a rebalance may land while the fetch was out
                    self.apply_membership_events().await;
                    self.complete(result).await;
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }

        // abandon whatever is still in flight
        drop(inflight);
        self.shutdown().await;
        Ok(())
    }

    /// Issue work for every assigned partition that is not in flight, backed
    /// off or idling. A pending seek cuts an idle pause short.
    fn schedule(&mut self, inflight: &mut FuturesUnordered<Work>) {
        let now = Instant::now();
        let ready: Vec<TopicPartition> = self
            .cursors
            .keys()
            .chain(self.unresolved.iter())
            .filter(|tp| !self.in_flight.contains(*tp))
            .cloned()
            .collect();

        for tp in ready {
            if self.backoff.get(&tp).is_some_and(|b| b.not_before > now) {
                continue;
            }
            if self.idle.get(&tp).is_some_and(|until| *until > now) && !self.registry.has_pending(&tp) {
                continue;
            }
            self.idle.remove(&tp);

            let start = self.prepare(&tp);
            let epoch = self.epochs.get(&tp).copied().unwrap_or_default();
            self.in_flight.insert(tp.clone());
            inflight.push(partition_work(self.context.clone(), tp, epoch, start).boxed());
        }
    }

    /// Earliest moment a waiting partition becomes eligible again, bounded by
    /// the idle pause so seeks and rebalances are picked up.
    fn next_wake(&self) -> Instant {
        let now = Instant::now();
        let limit = now + self.config.max_wait_time();
        self.backoff
            .values()
            .map(|b| b.not_before)
            .chain(self.idle.values().copied())
            .filter(|at| *at > now)
            .fold(limit, Instant::min)
    }

    /// Apply a pending seek, or decide how to start a partition that has no
    /// concrete offset yet.
    fn prepare(&mut self, tp: &TopicPartition) -> Start {
        if let Some(seek) = self.registry.take_pending(tp) {
            info!("Seeking {} to offset {}", tp, seek.offset);
            self.unresolved.remove(tp);
            self.out_of_range.remove(tp);
            self.cursors
                .entry(tp.clone())
                .and_modify(|cursor| cursor.seek_to(seek.offset))
                .or_insert_with(|| PartitionCursor::new(seek.offset, self.auto_commit));
            self.publish(tp);
            let _ = self.events.send(ConsumerEvent::Seek {
                topic_partition: tp.clone(),
                offset: seek.offset,
            });
            return Start::At(seek.offset);
        }

        if self.unresolved.contains(tp) {
            return Start::Initial;
        }
        if self.out_of_range.contains(tp) {
            return Start::OutOfRange;
        }
        match self.cursors.get(tp) {
            Some(cursor) => Start::At(cursor.fetch_offset()),
            None => Start::Initial,
        }
    }

    /// Apply a finished unit of work.
    async fn complete(&mut self, result: WorkResult) {
        let WorkResult {
            tp,
            epoch,
            resolved,
            fetched_at,
            outcome,
        } = result;

        if self.epochs.get(&tp) != Some(&epoch) {
            debug!("Dropping fetch result for revoked partition {}", tp);
            return;
        }
        if self.registry.has_pending(&tp) {
            // the next unit of work applies the seek; never deliver pre-seek data
            debug!("Dropping fetch result for {}, a seek is pending", tp);
            return;
        }

        let Some(fetched_at) = fetched_at else {
            if let Err(e) = outcome {
                self.fail(&tp, e.to_string());
            }
            return;
        };

        if let Some(offset) = resolved {
            self.install_resolved(&tp, offset);
        }

        match outcome {
            Ok(batch) => {
                self.backoff.remove(&tp);
                if !self.deliver(&tp, fetched_at, batch).await {
                    self.idle.insert(tp, Instant::now() + self.config.max_wait_time());
                }
            }
            Err(e) if e.is_offset_out_of_range() => {
                warn!("Fetch for {} at offset {} out of range", tp, fetched_at);
                self.backoff.remove(&tp);
                self.out_of_range.insert(tp);
            }
            Err(e) => self.fail(&tp, e.to_string()),
        }
    }

    fn install_resolved(&mut self, tp: &TopicPartition, offset: i64) {
        self.unresolved.remove(tp);
        let reset_from = self.out_of_range.remove(tp);

        let cursor = self
            .cursors
            .entry(tp.clone())
            .or_insert_with(|| PartitionCursor::new(offset, self.auto_commit));
        let from = cursor.fetch_offset();
        cursor.seek_to(offset);

        if reset_from {
            let _ = self.events.send(ConsumerEvent::OffsetReset {
                topic_partition: tp.clone(),
                from,
                to: offset,
            });
        }
        self.publish(tp);
    }

    /// Hand records to user code in broker order, advancing the cursor after
    /// each one. Returns whether anything was delivered.
    async fn deliver(&mut self, tp: &TopicPartition, fetched_at: i64, batch: FetchedBatch) -> bool {
        let handler = self.handler.clone();
        let Some(cursor) = self.cursors.get_mut(tp) else {
            return false;
        };
        if cursor.fetch_offset() != fetched_at {
            debug!("Dropping stale batch for {} fetched at {}", tp, fetched_at);
            return false;
        }

        let mut delivered = 0usize;
        let mut failure = None;
        for record in &batch.records {
            // compressed batches may start before the requested offset
            if record.offset < cursor.fetch_offset() {
                continue;
            }
            match handler.each_message(EachMessagePayload::new(tp, record)).await {
                Ok(()) => {
                    cursor.advance(record.offset);
                    delivered += 1;
                }
                Err(e) => {
                    failure = Some(format!("eachMessage failed at offset {}: {e:#}", record.offset));
                    break;
                }
            }
        }

        if delivered > 0 {
            debug!("Delivered {} records from {}, next offset {}", delivered, tp, cursor.fetch_offset());
            if cursor.auto_commit() {
                if let (Some(scheduler), Some(offset)) = (&self.scheduler, cursor.next_commit_offset()) {
                    scheduler.schedule(tp.clone(), offset);
                }
            }
        }
        self.publish(tp);

        if let Some(error) = failure {
            self.fail(tp, error);
        }
        delivered > 0
    }

    /// Count a failure against the partition's retry budget and back it off.
    /// Other partitions keep going.
    fn fail(&mut self, tp: &TopicPartition, error: String) {
        let retry = &self.config.retry;
        let now = Instant::now();
        let backoff = self.backoff.entry(tp.clone()).or_insert(Backoff {
            attempts: 0,
            not_before: now,
        });
        backoff.attempts += 1;

        if backoff.attempts > retry.retries {
            error!("{} exhausted {} retries: {}", tp, retry.retries, error);
            let _ = self.events.send(ConsumerEvent::Crash {
                topic_partition: tp.clone(),
                error,
            });
            backoff.not_before = now + retry.delay(backoff.attempts);
            backoff.attempts = 0;
        } else {
            warn!("Retrying {} (attempt {}): {}", tp, backoff.attempts, error);
            let _ = self.events.send(ConsumerEvent::FetchRetry {
                topic_partition: tp.clone(),
                attempt: backoff.attempts,
                error,
            });
            backoff.not_before = now + retry.delay(backoff.attempts);
        }
    }

    async fn apply_membership_events(&mut self) {
        while let Some(event) = self.services.membership.poll_event() {
            match event {
                AssignmentEvent::Assigned(partitions) => self.assign(partitions),
                AssignmentEvent::Revoked(partitions) => self.revoke(partitions).await,
            }
        }
    }

    /// Start tracking `partitions`. Their first unit of work looks up the
    /// group's committed offset.
    fn assign(&mut self, partitions: Vec<TopicPartition>) {
        for tp in partitions {
            if self.epochs.contains_key(&tp) {
                continue;
            }
            info!("Assigned {}", tp);
            self.next_epoch += 1;
            self.epochs.insert(tp.clone(), self.next_epoch);
            self.unresolved.insert(tp);
        }
    }

    /// Forget `partitions`. Whatever was consumed on them is committed;
    /// fetched-but-undelivered data is not.
    async fn revoke(&mut self, partitions: Vec<TopicPartition>) {
        for tp in &partitions {
            info!("Revoked {}", tp);
            self.epochs.remove(tp);
            self.cursors.remove(tp);
            self.unresolved.remove(tp);
            self.out_of_range.remove(tp);
            self.backoff.remove(tp);
            self.idle.remove(tp);
            self.positions.remove(tp);
            self.registry.discard(tp);
        }
        if let Some(scheduler) = &self.scheduler {
            if let Err(e) = scheduler.revoke(partitions).await {
                warn!("Commit on revocation failed for group {}: {}", self.group_id, e);
            }
        }
    }

    fn publish(&self, tp: &TopicPartition) {
        if let Some(cursor) = self.cursors.get(tp) {
            self.positions.insert(tp.clone(), cursor.position());
        }
    }

    async fn shutdown(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            if let Err(e) = scheduler.flush().await {
                warn!("Final commit for group {} failed: {}", self.group_id, e);
            }
            scheduler.shutdown().await;
        }
        info!("Consumer for group {} stopped", self.group_id);
        let _ = self.events.send(ConsumerEvent::Stop);
    }
}

/// One partition's resolve-then-fetch step. Owns everything it touches so
/// many can be in flight at once.
async fn partition_work(context: Arc<WorkContext>, tp: TopicPartition, epoch: u64, start: Start) -> WorkResult {
    let resolution = match start {
        Start::At(offset) => Ok((offset, None)),
        Start::Initial => context
            .initial_offset(&tp)
            .await
            .map(|offset| (offset, Some(offset))),
        Start::OutOfRange => context
            .resolver
            .resolve_out_of_range(&tp)
            .await
            .map(|offset| (offset, Some(offset))),
    };

    match resolution {
        Ok((offset, resolved)) => {
            let outcome = context.fetcher.fetch(&tp, offset).await;
            WorkResult {
                tp,
                epoch,
                resolved,
                fetched_at: Some(offset),
                outcome,
            }
        }
        Err(e) => WorkResult {
            tp,
            epoch,
            resolved: None,
            fetched_at: None,
            outcome: Err(e),
        },
    }
}
