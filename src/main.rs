use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kafka_cg::kafka::broker::{BrokerServices, MemoryBroker, MemoryGroup};
use kafka_cg::{Consumer, ConsumerConfig, EachMessagePayload, RunConfig, TopicPartition};
use log::info;
use tokio_stream::StreamExt;

const DEMO_TOPIC: &str = "demo";

fn load_config() -> Result<ConsumerConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading consumer config {}", path))?;
            ConsumerConfig::from_json(&json).with_context(|| format!("parsing consumer config {}", path))
        }
        None => Ok(ConsumerConfig {
            from_beginning: true,
            ..ConsumerConfig::new("demo-group")
        }),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let config = load_config()?;
    let broker = Arc::new(MemoryBroker::new(config.max_batch_records));
    broker.create_topic(DEMO_TOPIC, 2);
    let partitions = vec![TopicPartition::new(DEMO_TOPIC, 0), TopicPartition::new(DEMO_TOPIC, 1)];
    for tp in &partitions {
        for i in 0..5 {
            broker.produce(tp, Some(format!("key-{i}").as_str()), &format!("value-{i} on {tp}"))?;
        }
    }

    let group = Arc::new(MemoryGroup::new(partitions.clone()));
    let consumer = Consumer::new(config, BrokerServices::from_broker(broker.clone(), group));

    let mut events = consumer.events();
    tokio::spawn(async move {
        while let Some(Ok(event)) = events.next().await {
            if let Ok(json) = serde_json::to_string(&event) {
                info!("event {}", json);
            }
        }
    });

    consumer
        .run(RunConfig::default(), |payload: EachMessagePayload| async move {
            info!(
                "{}/{} offset={} value={:?}",
                payload.topic, payload.partition, payload.message.offset, payload.message.value
            );
            anyhow::Ok(())
        })
        .await?;

    // replay the tail of partition 0
    consumer.seek(DEMO_TOPIC, 0, "3")?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    consumer.stop().await?;
    for (tp, offset) in consumer.committed_offsets(DEMO_TOPIC).await? {
        info!("committed {} = {}", tp, offset);
    }
    Ok(())
}
