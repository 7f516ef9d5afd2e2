mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{config, tp, wait_for, Harness, Recorder, SlowMetadata, TOPIC};
use kafka_cg::kafka::broker::BrokerServices;
use kafka_cg::{BrokerError, CommitError, ConsumerConfig, ConsumerEvent, EachMessagePayload, RunConfig};

fn from_beginning(group_id: &str) -> ConsumerConfig {
    ConsumerConfig {
        from_beginning: true,
        ..config(group_id)
    }
}

#[tokio::test]
async fn delivers_every_partition_in_order_and_commits_on_stop() {
    let harness = Harness::new(
        ConsumerConfig {
            max_batch_records: 2,
            ..from_beginning("loop-basic")
        },
        3,
        5,
    );
    let recorder = Recorder::default();
    harness
        .consumer
        .run(RunConfig::default(), recorder.clone())
        .await
        .unwrap();

    wait_for("all records", || recorder.len() == 15).await;
    for partition in 0..3 {
        assert_eq!(recorder.offsets(partition), vec![0, 1, 2, 3, 4]);
    }

    let position = harness.consumer.positions()[&tp(1)];
    assert_eq!(position.fetch_offset, 5);
    assert_eq!(position.consumed_offset, Some(4));

    harness.consumer.stop().await.unwrap();
    assert_eq!(
        harness.consumer.committed_offsets(TOPIC).await.unwrap(),
        vec![(tp(0), 5), (tp(1), 5), (tp(2), 5)]
    );
    harness.expect_event("stop", |e| *e == ConsumerEvent::Stop).await;
}

#[tokio::test]
async fn starts_at_the_high_watermark_without_from_beginning() {
    let harness = Harness::new(config("loop-latest"), 1, 3);
    let recorder = Recorder::default();
    harness
        .consumer
        .run(RunConfig::default(), recorder.clone())
        .await
        .unwrap();

    wait_for("initial resolution", || harness.consumer.positions().contains_key(&tp(0))).await;
    harness.produce(0, "fresh");
    wait_for("fresh record", || recorder.len() == 1).await;

    assert_eq!(recorder.offsets(0), vec![3]);
    assert_eq!(recorder.values(0), vec!["fresh".to_string()]);
    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn resumes_from_the_committed_offset() {
    let harness = Harness::new(from_beginning("loop-committed"), 1, 5);
    harness.consumer.commit_offsets(&[(tp(0), 3)]).await.unwrap();

    let recorder = Recorder::default();
    harness
        .consumer
        .run(RunConfig::default(), recorder.clone())
        .await
        .unwrap();

    wait_for("records after the commit", || recorder.offsets(0).last() == Some(&4)).await;
    assert_eq!(recorder.offsets(0), vec![3, 4]);
    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn committed_offset_lost_to_retention_resets_to_earliest() {
    let harness = Harness::new(from_beginning("loop-retention"), 1, 6);
    harness.consumer.commit_offsets(&[(tp(0), 1)]).await.unwrap();
    harness.broker.truncate_before(&tp(0), 4);

    let recorder = Recorder::default();
    harness
        .consumer
        .run(RunConfig::default(), recorder.clone())
        .await
        .unwrap();

    wait_for("retained records", || recorder.offsets(0).last() == Some(&5)).await;
    assert_eq!(recorder.offsets(0), vec![4, 5]);
    harness
        .expect_event("reset", |e| {
            *e == ConsumerEvent::OffsetReset {
                topic_partition: tp(0),
                from: 1,
                to: 4,
            }
        })
        .await;
    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn transient_fetch_errors_are_retried_per_partition() {
    let harness = Harness::new(from_beginning("loop-retry"), 2, 3);
    harness
        .broker
        .fail_next_fetch(&tp(0), BrokerError::Connection("reset by peer".into()));

    let recorder = Recorder::default();
    harness
        .consumer
        .run(RunConfig::default(), recorder.clone())
        .await
        .unwrap();

    wait_for("both partitions", || recorder.len() == 6).await;
    assert_eq!(recorder.offsets(0), vec![0, 1, 2]);
    assert_eq!(recorder.offsets(1), vec![0, 1, 2]);
    harness
        .expect_event("retry", |e| {
            matches!(
                e,
                ConsumerEvent::FetchRetry { topic_partition, attempt: 1, .. } if *topic_partition == tp(0)
            )
        })
        .await;
    assert!(!harness.has_event(|e| matches!(e, ConsumerEvent::Crash { .. })));
    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_crash_the_partition_and_then_recover() {
    let harness = Harness::new(from_beginning("loop-crash"), 1, 2);
    for _ in 0..3 {
        harness
            .broker
            .fail_next_fetch(&tp(0), BrokerError::Connection("broker down".into()));
    }

    let recorder = Recorder::default();
    harness
        .consumer
        .run(RunConfig::default(), recorder.clone())
        .await
        .unwrap();

    wait_for("records after the crash", || recorder.len() == 2).await;
    harness
        .expect_event("crash", |e| matches!(e, ConsumerEvent::Crash { .. }))
        .await;
    assert_eq!(harness.count_events(|e| matches!(e, ConsumerEvent::FetchRetry { .. })), 2);
    assert_eq!(harness.count_events(|e| matches!(e, ConsumerEvent::Crash { .. })), 1);
    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn failed_handler_redelivers_from_the_failing_record() {
    let harness = Harness::new(from_beginning("loop-handler"), 1, 3);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let failed_once = Arc::new(AtomicBool::new(false));

    let handler = {
        let seen = seen.clone();
        let failed_once = failed_once.clone();
        move |payload: EachMessagePayload| {
            let seen = seen.clone();
            let failed_once = failed_once.clone();
            async move {
                if payload.offset() == 1 && !failed_once.swap(true, Ordering::SeqCst) {
                    anyhow::bail!("database unavailable");
                }
                seen.lock().unwrap().push(payload.offset());
                Ok(())
            }
        }
    };
    harness
        .consumer
        .run(RunConfig::default(), handler)
        .await
        .unwrap();

    wait_for("redelivery", || seen.lock().unwrap().len() == 3).await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    harness
        .expect_event("handler retry", |e| {
            matches!(
                e,
                ConsumerEvent::FetchRetry { error, .. } if error.contains("database unavailable")
            )
        })
        .await;

    harness.consumer.stop().await.unwrap();
    assert_eq!(harness.broker.committed_offset("loop-handler", &tp(0)), Some(3));
}

#[tokio::test]
async fn revoked_partitions_commit_and_stop_delivering() {
    let harness = Harness::new(from_beginning("loop-revoke"), 2, 3);
    let recorder = Recorder::default();
    harness
        .consumer
        .run(RunConfig::default(), recorder.clone())
        .await
        .unwrap();
    wait_for("initial records", || recorder.len() == 6).await;

    harness.group.revoke(vec![tp(1)]);
    wait_for("revocation commit", || {
        harness.broker.committed_offset("loop-revoke", &tp(1)) == Some(3)
    })
    .await;
    assert!(!harness.consumer.positions().contains_key(&tp(1)));

    harness.produce(1, "after revoke");
    harness.produce(0, "still ours");
    wait_for("partition 0 keeps going", || recorder.offsets(0).len() == 4).await;
    assert_eq!(recorder.offsets(1), vec![0, 1, 2]);

    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn newly_assigned_partitions_start_from_their_commit() {
    let harness = Harness::new(from_beginning("loop-assign"), 2, 4);
    harness.group.revoke(vec![tp(1)]);
    harness.consumer.commit_offsets(&[(tp(1), 2)]).await.unwrap();

    let recorder = Recorder::default();
    harness
        .consumer
        .run(RunConfig::default(), recorder.clone())
        .await
        .unwrap();
    wait_for("partition 0", || recorder.offsets(0).len() == 4).await;
    assert!(recorder.offsets(1).is_empty());

    harness.group.assign(vec![tp(1)]);
    wait_for("partition 1 from its commit", || recorder.offsets(1).len() == 2).await;
    assert_eq!(recorder.offsets(1), vec![2, 3]);

    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn run_twice_is_rejected_and_stop_is_idempotent() {
    let harness = Harness::new(config("loop-lifecycle"), 1, 1);
    harness
        .consumer
        .run(RunConfig::default(), Recorder::default())
        .await
        .unwrap();

    assert!(harness.consumer.is_running());
    assert!(harness
        .consumer
        .run(RunConfig::default(), Recorder::default())
        .await
        .is_err());

    harness.consumer.stop().await.unwrap();
    harness.consumer.stop().await.unwrap();
    assert!(!harness.consumer.is_running());
    harness.expect_event("stop", |e| *e == ConsumerEvent::Stop).await;
    assert_eq!(harness.count_events(|e| *e == ConsumerEvent::Stop), 1);
}

#[tokio::test]
async fn manual_commit_rejects_negative_offsets() {
    let harness = Harness::new(config("loop-manual-commit"), 1, 1);

    let err = harness
        .consumer
        .commit_offsets(&[(tp(0), -1)])
        .await
        .unwrap_err();
    assert!(matches!(err, CommitError::InvalidOffset { offset: -1, .. }));

    harness.consumer.commit_offsets(&[(tp(0), 1)]).await.unwrap();
    assert_eq!(harness.consumer.committed_offsets(TOPIC).await.unwrap(), vec![(tp(0), 1)]);
}

#[tokio::test]
async fn failed_committed_offset_lookup_is_retried_not_skipped() {
    let harness = Harness::new(config("loop-offset-lookup"), 1, 5);
    harness.consumer.commit_offsets(&[(tp(0), 2)]).await.unwrap();
    harness
        .broker
        .fail_next_offset_fetch(BrokerError::Connection("coordinator moved".into()));

    let recorder = Recorder::default();
    harness
        .consumer
        .run(RunConfig::default(), recorder.clone())
        .await
        .unwrap();

    wait_for("records from the commit", || recorder.offsets(0).last() == Some(&4)).await;
    assert_eq!(recorder.offsets(0), vec![2, 3, 4]);
    harness
        .expect_event("lookup retry", |e| {
            matches!(
                e,
                ConsumerEvent::FetchRetry { topic_partition, error, .. }
                    if *topic_partition == tp(0) && error.contains("coordinator moved")
            )
        })
        .await;
    harness.consumer.stop().await.unwrap();
}

#[tokio::test]
async fn slow_resolution_does_not_hold_back_other_partitions() {
    let harness = Harness::with_services(
        ConsumerConfig {
            max_batch_records: 1,
            ..from_beginning("loop-slow-partition")
        },
        2,
        3,
        |broker, group| BrokerServices {
            membership: group,
            fetcher: broker.clone(),
            metadata: Arc::new(SlowMetadata {
                inner: broker.clone(),
                slow: tp(0),
                delay: Duration::from_secs(30),
            }),
            commits: broker,
        },
    );
    let recorder = Recorder::default();
    harness
        .consumer
        .run(RunConfig::default(), recorder.clone())
        .await
        .unwrap();

    wait_for("partition 1 drained", || recorder.offsets(1) == vec![0, 1, 2]).await;
    assert!(recorder.offsets(0).is_empty());

    harness.consumer.stop().await.unwrap();
    assert_eq!(harness.broker.committed_offset("loop-slow-partition", &tp(1)), Some(3));
}
