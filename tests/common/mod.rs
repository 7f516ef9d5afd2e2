#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kafka_cg::kafka::broker::{BrokerServices, FetchService, MemoryBroker, MemoryGroup, MetadataService};
use kafka_cg::kafka::types::FetchedBatch;
use kafka_cg::{
    BrokerError, Consumer, ConsumerConfig, ConsumerEvent, EachMessagePayload, MessageHandler, RetryConfig,
    TopicPartition,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::StreamExt;

pub const TOPIC: &str = "topic-test";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn tp(partition: i32) -> TopicPartition {
    TopicPartition::new(TOPIC, partition)
}

/// Tight timings so failure paths finish quickly.
pub fn config(group_id: &str) -> ConsumerConfig {
    ConsumerConfig {
        max_wait_time_ms: 5,
        retry: RetryConfig {
            retries: 2,
            initial_retry_time_ms: 5,
            max_retry_time_ms: 20,
            multiplier: 2.0,
        },
        ..ConsumerConfig::new(group_id)
    }
}

pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Handler that remembers every payload it accepted.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<EachMessagePayload>>>,
}

impl Recorder {
    pub fn offsets(&self, partition: i32) -> Vec<i64> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|payload| payload.partition == partition)
            .map(EachMessagePayload::offset)
            .collect()
    }

    pub fn values(&self, partition: i32) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|payload| payload.partition == partition)
            .filter_map(|payload| payload.message.value.as_ref())
            .map(|value| String::from_utf8_lossy(value).into_owned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn each_message(&self, payload: EachMessagePayload) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(payload);
        Ok(())
    }
}

pub struct Harness {
    pub broker: Arc<MemoryBroker>,
    pub group: Arc<MemoryGroup>,
    pub consumer: Consumer,
    pub events: Arc<Mutex<Vec<ConsumerEvent>>>,
}

impl Harness {
    /// `partitions` partitions of `TOPIC`, each holding `records` values
    /// named `value-<offset>`, all assigned to the consumer on join.
    pub fn new(config: ConsumerConfig, partitions: i32, records: usize) -> Self {
        Self::with_services(config, partitions, records, |broker, group| {
            BrokerServices::from_broker(broker, group)
        })
    }

    /// Like [`Harness::new`], with `wire` choosing which services the
    /// consumer talks to.
    pub fn with_services<W>(config: ConsumerConfig, partitions: i32, records: usize, wire: W) -> Self
    where
        W: FnOnce(Arc<MemoryBroker>, Arc<MemoryGroup>) -> BrokerServices,
    {
        init_logger();
        let broker = Arc::new(MemoryBroker::new(config.max_batch_records));
        broker.create_topic(TOPIC, partitions);
        for partition in 0..partitions {
            for offset in 0..records {
                broker
                    .produce(&tp(partition), None, &format!("value-{offset}"))
                    .unwrap();
            }
        }

        let group = Arc::new(MemoryGroup::new((0..partitions).map(tp).collect()));
        let consumer = Consumer::new(config, wire(broker.clone(), group.clone()));
        let events = Arc::new(Mutex::new(Vec::new()));

        let mut stream = consumer.events();
        let sink = events.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let Ok(event) = event {
                    sink.lock().unwrap().push(event);
                }
            }
        });

        Self {
            broker,
            group,
            consumer,
            events,
        }
    }

    pub fn produce(&self, partition: i32, value: &str) -> i64 {
        self.broker.produce(&tp(partition), None, value).unwrap()
    }

    pub fn has_event<F>(&self, matches: F) -> bool
    where
        F: Fn(&ConsumerEvent) -> bool,
    {
        self.events.lock().unwrap().iter().any(matches)
    }

    /// Events reach the log through a separate task, so give it time.
    pub async fn expect_event<F>(&self, what: &str, matches: F)
    where
        F: Fn(&ConsumerEvent) -> bool,
    {
        wait_for(what, || self.has_event(&matches)).await;
    }

    pub fn count_events<F>(&self, matches: F) -> usize
    where
        F: Fn(&ConsumerEvent) -> bool,
    {
        self.events.lock().unwrap().iter().filter(|e| matches(e)).count()
    }
}

/// Fetches that block while the gate is closed.
pub struct GatedFetcher {
    inner: Arc<MemoryBroker>,
    open: watch::Sender<bool>,
    entered: AtomicUsize,
}

impl GatedFetcher {
    pub fn new(inner: Arc<MemoryBroker>) -> Self {
        let (open, _) = watch::channel(true);
        Self {
            inner,
            open,
            entered: AtomicUsize::new(0),
        }
    }

    pub fn close(&self) {
        self.open.send_replace(false);
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Fetches issued so far, including ones still held at the gate.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FetchService for GatedFetcher {
    async fn fetch(&self, topic_partition: &TopicPartition, offset: i64) -> Result<FetchedBatch, BrokerError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        self.inner.fetch(topic_partition, offset).await
    }
}

/// Offset lookups that take `delay` for one partition.
pub struct SlowMetadata {
    pub inner: Arc<MemoryBroker>,
    pub slow: TopicPartition,
    pub delay: Duration,
}

#[async_trait]
impl MetadataService for SlowMetadata {
    async fn earliest_offset(&self, topic_partition: &TopicPartition) -> Result<i64, BrokerError> {
        if *topic_partition == self.slow {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.earliest_offset(topic_partition).await
    }

    async fn latest_offset(&self, topic_partition: &TopicPartition) -> Result<i64, BrokerError> {
        if *topic_partition == self.slow {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.latest_offset(topic_partition).await
    }
}
