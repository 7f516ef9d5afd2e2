use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use indexmap::IndexMap;
use log::{debug, info, warn};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::events::ConsumerEvent;
use crate::kafka::broker::CommitService;
use crate::kafka::config::RunConfig;
use crate::kafka::error::CommitError;
use crate::kafka::types::TopicPartition;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

type CommitReply = RpcReplyPort<Result<(), CommitError>>;

struct CommitActor;

pub(crate) enum Message {
    Schedule(TopicPartition, i64),
    Flush(Option<CommitReply>),
    Revoke(Vec<TopicPartition>, CommitReply),
}

struct Args {
    group_id: String,
    commits: Arc<dyn CommitService>,
    interval: Option<Duration>,
    threshold: Option<usize>,
    events: broadcast::Sender<ConsumerEvent>,
}

struct State {
    group_id: String,
    commits: Arc<dyn CommitService>,
    // next offset to commit, per partition, latest value wins
    pending: IndexMap<TopicPartition, i64>,
    scheduled_since_flush: usize,
    threshold: Option<usize>,
    events: broadcast::Sender<ConsumerEvent>,
    ticker: Option<JoinHandle<()>>,
}

impl State {
    /// Commit pending offsets, optionally only for `only`. On failure the
    /// offsets stay pending and go out with the next flush.
    async fn flush(&mut self, only: Option<&[TopicPartition]>) -> Result<(), CommitError> {
        let offsets: IndexMap<TopicPartition, i64> = self
            .pending
            .iter()
            .filter(|(tp, _)| only.is_none_or(|only| only.contains(tp)))
            .map(|(tp, offset)| (tp.clone(), *offset))
            .collect();
        if offsets.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.commits.commit(&self.group_id, &offsets).await {
            warn!(
                "Failed to commit {} offsets for group {}, retrying on next flush: {}",
                offsets.len(),
                self.group_id,
                e
            );
            return Err(e.into());
        }

        for tp in offsets.keys() {
            self.pending.shift_remove(tp);
        }
        if only.is_none() {
            self.scheduled_since_flush = 0;
        }
        info!("Committed {} offsets for group {}", offsets.len(), self.group_id);
        let _ = self.events.send(ConsumerEvent::CommitOffsets {
            offsets: offsets.into_iter().collect(),
        });
        Ok(())
    }
}

impl Actor for CommitActor {
    type Msg = Message;
    type State = State;
    type Arguments = Args;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let ticker = args.interval.map(|period| {
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                // first tick fires immediately
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if myself.send_message(Message::Flush(None)).is_err() {
                        break;
                    }
                }
            })
        });

        Ok(State {
            group_id: args.group_id,
            commits: args.commits,
            pending: IndexMap::new(),
            scheduled_since_flush: 0,
            threshold: args.threshold,
            events: args.events,
            ticker,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            Message::Schedule(tp, offset) => {
                debug!("Scheduling commit of offset {} for {}", offset, tp);
                state.pending.insert(tp, offset);
                state.scheduled_since_flush += 1;
                if state
                    .threshold
                    .is_some_and(|threshold| state.scheduled_since_flush >= threshold)
                {
                    let _ = state.flush(None).await;
                }
            }
            Message::Flush(reply) => {
                let result = state.flush(None).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Message::Revoke(partitions, reply) => {
                let result = state.flush(Some(&partitions)).await;
                // no longer ours, whether or not the commit went through
                for tp in &partitions {
                    state.pending.shift_remove(tp);
                }
                let _ = reply.send(result);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        if !state.pending.is_empty() {
            warn!(
                "Commit scheduler for group {} stopped with {} uncommitted offsets",
                state.group_id,
                state.pending.len()
            );
        }
        Ok(())
    }
}

/// Batches auto-commits across partitions and flushes them on a cadence.
pub struct CommitScheduler {
    actor: ActorRef<Message>,
    handle: JoinHandle<()>,
}

impl CommitScheduler {
    pub async fn spawn(
        group_id: String,
        commits: Arc<dyn CommitService>,
        run: &RunConfig,
        events: broadcast::Sender<ConsumerEvent>,
    ) -> Result<Self> {
        let args = Args {
            group_id,
            commits,
            interval: run.auto_commit_interval_ms.map(Duration::from_millis),
            threshold: run.auto_commit_threshold,
            events,
        };
        let (actor, handle) = Actor::spawn(None, CommitActor, args).await?;
        Ok(Self { actor, handle })
    }

    /// Never waits on the broker.
    pub fn schedule(&self, tp: TopicPartition, offset: i64) {
        if self.actor.send_message(Message::Schedule(tp.clone(), offset)).is_err() {
            warn!("Commit scheduler stopped, dropping offset {} for {}", offset, tp);
        }
    }

    pub async fn flush(&self) -> Result<(), CommitError> {
        self.call(|reply| Message::Flush(Some(reply))).await
    }

    /// Commit what was consumed on `partitions` and forget them.
    pub async fn revoke(&self, partitions: Vec<TopicPartition>) -> Result<(), CommitError> {
        self.call(|reply| Message::Revoke(partitions, reply)).await
    }

    pub async fn shutdown(self) {
        self.actor.stop(None);
        let _ = self.handle.await;
    }

    async fn call<F>(&self, build: F) -> Result<(), CommitError>
    where
        F: FnOnce(CommitReply) -> Message,
    {
        match self.actor.call(build, Some(CALL_TIMEOUT)).await {
            Ok(CallResult::Success(result)) => result,
            _ => Err(CommitError::SchedulerUnavailable),
        }
    }
}
