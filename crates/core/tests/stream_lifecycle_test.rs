//! Stream lifecycle and delivery semantics: event fan-out, stale-publication
//! filtering during turnover, clean end versus upstream failure, and broken
//! client write paths.

mod common;

use common::test_cluster::{FailingSink, RecordingSink, TestCluster};

use relay_leases::LeaseStore;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use relay_bus::{PublicationBus, TaggedPublication};
use relay_core::SubscriptionEnd;
use relay_types::{ChannelName, LeadershipId};
use tokio::time::timeout;
use tracing_test::traced_test;

fn channel() -> ChannelName {
    ChannelName::new("stream/metrics").unwrap()
}

#[traced_test]
#[tokio::test]
async fn test_events_fan_out_to_all_nodes() {
    let cluster = TestCluster::new(2).await;
    let script = cluster.producer.script(&channel());

    let leader_sink = Arc::new(RecordingSink::new());
    let follower_sink = Arc::new(RecordingSink::new());

    cluster
        .node(0)
        .subscribe(channel(), leader_sink.clone())
        .await
        .expect("leader subscribe failed");
    cluster
        .node(1)
        .subscribe(channel(), follower_sink.clone())
        .await
        .expect("follower subscribe failed");

    script.emit("event-1");
    script.emit("event-2");

    let deadline = Duration::from_secs(2);
    assert_eq!(
        leader_sink.wait_for(2, deadline).await,
        vec![Bytes::from("event-1"), Bytes::from("event-2")]
    );
    assert_eq!(
        follower_sink.wait_for(2, deadline).await,
        vec![Bytes::from("event-1"), Bytes::from("event-2")]
    );

    cluster.node(0).shutdown().await;
    cluster.node(1).shutdown().await;
}

#[traced_test]
#[tokio::test]
async fn test_stale_tagged_publication_is_dropped() {
    let cluster = TestCluster::new(1).await;
    let script = cluster.producer.script(&channel());

    let sink = Arc::new(RecordingSink::new());
    let handle = cluster
        .node(0)
        .subscribe(channel(), sink.clone())
        .await
        .expect("subscribe failed");

    // A publication tagged with a previous tenure's id arrives mid-turnover.
    cluster
        .bus
        .publish(TaggedPublication {
            channel: channel(),
            leadership_id: LeadershipId::mint(),
            payload: Bytes::from("stale"),
        })
        .await
        .unwrap();

    script.emit("fresh");

    // Only the correctly tagged event reaches the client, and the
    // subscription sees no disruption.
    let delivered = sink.wait_for(1, Duration::from_secs(2)).await;
    assert_eq!(delivered, vec![Bytes::from("fresh")]);

    script.emit("still-flowing");
    sink.wait_for(2, Duration::from_secs(2)).await;

    cluster.node(0).unsubscribe(&handle).await;
    assert_eq!(
        timeout(Duration::from_secs(1), handle.closed()).await.unwrap(),
        SubscriptionEnd::Unsubscribed
    );
}

#[traced_test]
#[tokio::test]
async fn test_clean_upstream_end_signals_resubscribe_from_scratch() {
    let cluster = TestCluster::new(2).await;
    let script = cluster.producer.script(&channel());

    let leader_handle = cluster
        .node(0)
        .subscribe(channel(), Arc::new(RecordingSink::new()))
        .await
        .expect("leader subscribe failed");
    let follower_handle = cluster
        .node(1)
        .subscribe(channel(), Arc::new(RecordingSink::new()))
        .await
        .expect("follower subscribe failed");

    script.end();

    // Leader-local subscriptions get the distinguishable end-of-stream
    // signal; the lease is released with the tenure.
    let end = timeout(Duration::from_secs(1), leader_handle.closed())
        .await
        .expect("leader terminal signal did not arrive");
    assert_eq!(end, SubscriptionEnd::StreamEnded);

    // Followers observe the vacancy through their watch loops.
    let end = timeout(Duration::from_secs(2), follower_handle.closed())
        .await
        .expect("follower terminal signal did not arrive");
    assert_eq!(end, SubscriptionEnd::LeadershipLost);

    assert_eq!(cluster.store.get(&channel()).await.unwrap(), None);
    assert_eq!(cluster.producer.open_streams(&channel()), 0);

    cluster.node(0).shutdown().await;
    cluster.node(1).shutdown().await;
}

#[traced_test]
#[tokio::test]
async fn test_upstream_failure_is_distinguished_from_clean_end() {
    let cluster = TestCluster::new(1).await;
    let script = cluster.producer.script(&channel());

    let handle = cluster
        .node(0)
        .subscribe(channel(), Arc::new(RecordingSink::new()))
        .await
        .expect("subscribe failed");

    script.emit("last-event");
    script.fail("upstream connection reset");

    let end = timeout(Duration::from_secs(1), handle.closed())
        .await
        .expect("terminal signal did not arrive");
    assert_eq!(
        end,
        SubscriptionEnd::StreamFailed {
            reason: "scripted failure: upstream connection reset".to_string(),
        }
    );

    // The lease was released; the next subscribe starts from scratch.
    assert_eq!(cluster.store.get(&channel()).await.unwrap(), None);

    cluster.node(0).shutdown().await;
}

#[traced_test]
#[tokio::test]
async fn test_no_reconnect_without_a_new_subscribe() {
    let cluster = TestCluster::new(1).await;
    let script = cluster.producer.script(&channel());

    let handle = cluster
        .node(0)
        .subscribe(channel(), Arc::new(RecordingSink::new()))
        .await
        .expect("subscribe failed");

    script.end();
    timeout(Duration::from_secs(1), handle.closed())
        .await
        .expect("terminal signal did not arrive");

    // No subscriber is interested any more; nothing re-opens upstream.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cluster.producer.total_opens(&channel()), 1);
    assert_eq!(cluster.store.get(&channel()).await.unwrap(), None);

    cluster.node(0).shutdown().await;
}

#[traced_test]
#[tokio::test]
async fn test_broken_sink_tears_down_only_its_subscription() {
    let cluster = TestCluster::new(1).await;
    let script = cluster.producer.script(&channel());

    let healthy_sink = Arc::new(RecordingSink::new());
    let healthy = cluster
        .node(0)
        .subscribe(channel(), healthy_sink.clone())
        .await
        .expect("healthy subscribe failed");
    let broken = cluster
        .node(0)
        .subscribe(channel(), Arc::new(FailingSink))
        .await
        .expect("broken subscribe failed");

    script.emit("event-1");

    let end = timeout(Duration::from_secs(1), broken.closed())
        .await
        .expect("broken subscription did not close");
    assert_eq!(end, SubscriptionEnd::DeliveryFailed);

    // The healthy subscription keeps flowing.
    script.emit("event-2");
    assert_eq!(
        healthy_sink.wait_for(2, Duration::from_secs(2)).await,
        vec![Bytes::from("event-1"), Bytes::from("event-2")]
    );

    cluster.node(0).unsubscribe(&healthy).await;
    cluster.node(0).shutdown().await;
}

#[traced_test]
#[tokio::test]
async fn test_shutdown_signals_subscriptions_and_releases_leases() {
    let cluster = TestCluster::new(1).await;
    cluster.producer.script(&channel());

    let handle = cluster
        .node(0)
        .subscribe(channel(), Arc::new(RecordingSink::new()))
        .await
        .expect("subscribe failed");

    cluster.node(0).shutdown().await;

    assert_eq!(
        timeout(Duration::from_secs(1), handle.closed()).await.unwrap(),
        SubscriptionEnd::Shutdown
    );
    assert_eq!(cluster.store.get(&channel()).await.unwrap(), None);
    assert_eq!(cluster.producer.open_streams(&channel()), 0);
}
