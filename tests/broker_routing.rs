//! Integration tests for message routing through the broker façade.
//!
//! Covers direct, broadcast, multicast and channel fan-out, admission
//! limits, unknown-channel errors and concurrent senders.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarmlink::comms::{
    handler_fn, ChannelKind, ChannelOptions, CommsError, MessageBroker, SharedHandler,
};
use swarmlink::config::CommsConfig;

fn running(config: CommsConfig) -> Arc<MessageBroker> {
    let broker = Arc::new(MessageBroker::new(config));
    broker.initialize().unwrap();
    broker
}

fn counting(hits: &Arc<AtomicUsize>) -> SharedHandler {
    let hits = Arc::clone(hits);
    handler_fn(move |_message| {
        let hits = Arc::clone(&hits);
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Direct delivery
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn direct_messages_are_delivered_exactly_once_with_wellformed_ids() {
    let broker = running(CommsConfig::default());
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    broker
        .subscribe(
            "worker",
            "task",
            handler_fn(move |message| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(message.id.clone());
                    Ok(())
                }
            }),
        )
        .unwrap();

    let mut sent = Vec::new();
    for n in 0..20 {
        sent.push(
            broker
                .send_message("lead", "worker", "task", json!({ "n": n }))
                .unwrap(),
        );
    }

    wait_until(|| received.lock().len() >= 20).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let received = received.lock().clone();
    assert_eq!(received.len(), 20, "no duplicate deliveries");
    assert_eq!(received, sent, "direct lane preserves send order");
    assert!(sent.iter().all(|id| id.starts_with("msg_") && id.len() > 4));
    assert_eq!(sent.iter().collect::<HashSet<_>>().len(), 20);
}

#[tokio::test]
async fn oversized_messages_are_rejected_before_any_recipient_is_notified() {
    let config = CommsConfig {
        max_message_size: 64,
        ..CommsConfig::default()
    };
    let broker = running(config);
    let hits = Arc::new(AtomicUsize::new(0));
    broker.subscribe("worker", "task", counting(&hits)).unwrap();
    let channel = broker
        .create_channel("ops", ChannelKind::Broadcast, ChannelOptions::default())
        .unwrap();
    broker.join_channel(&channel, "worker").unwrap();

    let blob = json!({ "blob": "x".repeat(256) });
    let direct = broker
        .send_message("lead", "worker", "task", blob.clone())
        .unwrap_err();
    assert!(matches!(direct, CommsError::MessageTooLarge { max: 64, .. }));
    let fanout = broker
        .send_to_channel(&channel, "lead", "task", blob)
        .unwrap_err();
    assert!(fanout.is_validation());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    let metrics = broker.get_metrics();
    assert_eq!(metrics.messages_sent, 0);
    assert_eq!(metrics.inbox_messages, 0);
}

#[tokio::test]
async fn unsubscribing_twice_is_harmless_and_stops_delivery() {
    let broker = running(CommsConfig::default());
    let hits = Arc::new(AtomicUsize::new(0));
    let subscription = broker.subscribe("worker", "task", counting(&hits)).unwrap();

    assert!(broker.unsubscribe("worker", &subscription).unwrap());
    assert!(!broker.unsubscribe("worker", &subscription).unwrap());
    assert!(!broker.unsubscribe("worker", "sub_unknown").unwrap());

    broker
        .send_message("lead", "worker", "task", json!({}))
        .unwrap();
    wait_until(|| broker.get_metrics().inbox_messages == 1).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(broker.poll_messages("worker", 10).unwrap().len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Broadcast / multicast
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn broadcast_skips_sender_and_excluded_agents() {
    let broker = running(CommsConfig::default());
    for agent in ["a", "b", "c"] {
        broker.register_agent(agent).unwrap();
    }

    broker
        .broadcast("a", "notice", json!({}), &["c".to_string()])
        .unwrap();
    wait_until(|| broker.get_metrics().inbox_messages == 1).await;

    assert_eq!(broker.poll_messages("b", 10).unwrap().len(), 1);
    assert!(broker.poll_messages("a", 10).unwrap().is_empty());
    assert!(broker.poll_messages("c", 10).unwrap().is_empty());
}

#[tokio::test]
async fn multicast_deduplicates_recipients() {
    let broker = running(CommsConfig::default());
    let hits = Arc::new(AtomicUsize::new(0));
    broker.subscribe("a", "sync", counting(&hits)).unwrap();
    broker.subscribe("b", "sync", counting(&hits)).unwrap();

    broker
        .multicast(
            "lead",
            &["a".to_string(), "b".to_string(), "a".to_string()],
            "sync",
            json!({}),
        )
        .unwrap();
    wait_until(|| hits.load(Ordering::SeqCst) >= 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unregistering_an_agent_drops_its_subscriptions_and_memberships() {
    let broker = running(CommsConfig::default());
    let hits = Arc::new(AtomicUsize::new(0));
    broker.subscribe("w", "task", counting(&hits)).unwrap();
    let channel = broker
        .create_channel("crew", ChannelKind::Broadcast, ChannelOptions::default())
        .unwrap();
    broker.join_channel(&channel, "w").unwrap();
    assert!(broker.known_agents().unwrap().contains(&"w".to_string()));

    assert!(broker.unregister_agent("w").unwrap());
    assert!(!broker.known_agents().unwrap().contains(&"w".to_string()));
    assert!(broker.get_channel(&channel).unwrap().participants.is_empty());

    broker.send_message("lead", "w", "task", json!({})).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Channels
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_channel_operations_report_not_found() {
    let broker = running(CommsConfig::default());
    assert!(broker.join_channel("chan_missing", "a").unwrap_err().is_not_found());
    assert!(broker.leave_channel("chan_missing", "a").unwrap_err().is_not_found());
    assert!(broker
        .send_to_channel("chan_missing", "a", "t", json!({}))
        .unwrap_err()
        .is_not_found());
    assert!(broker.delete_channel("chan_missing").unwrap_err().is_not_found());
}

#[tokio::test]
async fn repeated_join_and_leave_never_error() {
    let broker = running(CommsConfig::default());
    let channel = broker
        .create_channel("ops", ChannelKind::Topic, ChannelOptions::default())
        .unwrap();

    broker.leave_channel(&channel, "a").unwrap();
    broker.join_channel(&channel, "a").unwrap();
    broker.join_channel(&channel, "a").unwrap();
    assert_eq!(broker.get_channel(&channel).unwrap().participants.len(), 1);
    broker.leave_channel(&channel, "a").unwrap();
    broker.leave_channel(&channel, "a").unwrap();
    assert!(broker.get_channel(&channel).unwrap().participants.is_empty());
}

#[tokio::test]
async fn joining_a_full_channel_is_rejected() {
    let broker = running(CommsConfig::default());
    let channel = broker
        .create_channel(
            "pair",
            ChannelKind::Broadcast,
            ChannelOptions {
                max_participants: Some(2),
                ..ChannelOptions::default()
            },
        )
        .unwrap();
    broker.join_channel(&channel, "a").unwrap();
    broker.join_channel(&channel, "b").unwrap();
    broker.join_channel(&channel, "b").unwrap();
    assert!(matches!(
        broker.join_channel(&channel, "c"),
        Err(CommsError::ChannelFull {
            max_participants: 2,
            ..
        })
    ));
    assert!(!broker.known_agents().unwrap().contains(&"c".to_string()));
}

#[tokio::test]
async fn failed_joins_leave_the_agent_directory_untouched() {
    let broker = running(CommsConfig::default());
    assert!(broker.join_channel("chan_missing", "ghost").unwrap_err().is_not_found());
    assert!(broker.join_channel("chan_missing", "").unwrap_err().is_validation());
    assert!(broker.known_agents().unwrap().is_empty());
    assert_eq!(broker.get_metrics().agents, 0);

    // A broadcast after the failed join reaches nobody.
    broker.register_agent("lead").unwrap();
    broker.broadcast("lead", "notice", json!({}), &[]).unwrap();
    assert!(broker.poll_messages("ghost", 10).unwrap().is_empty());
}

#[tokio::test]
async fn topic_channel_delivers_only_to_matching_subscribers() {
    let broker = running(CommsConfig::default());
    let channel = broker
        .create_channel("alerts", ChannelKind::Topic, ChannelOptions::default())
        .unwrap();
    let a_hits = Arc::new(AtomicUsize::new(0));
    let b_hits = Arc::new(AtomicUsize::new(0));
    broker.join_channel(&channel, "a").unwrap();
    broker.join_channel(&channel, "b").unwrap();
    broker.subscribe("a", "alert", counting(&a_hits)).unwrap();
    broker.subscribe("b", "heartbeat", counting(&b_hits)).unwrap();

    broker
        .send_to_channel(&channel, "monitor", "status", json!({}))
        .unwrap();
    broker
        .send_to_channel(&channel, "monitor", "alert", json!({ "level": "high" }))
        .unwrap();

    wait_until(|| a_hits.load(Ordering::SeqCst) >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(a_hits.load(Ordering::SeqCst), 1, "only the alert reaches A");
    assert_eq!(b_hits.load(Ordering::SeqCst), 0);
    assert!(broker.poll_messages("a", 10).unwrap().is_empty());
    assert!(broker.poll_messages("b", 10).unwrap().is_empty());

    let dead = broker.dead_letters_recent(0, 10).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.message_type, "status");
    assert_eq!(dead[0].reason, "no recipients");
}

#[tokio::test]
async fn broadcast_channel_excludes_sender_and_ignores_filtering() {
    let broker = running(CommsConfig::default());
    let system = broker.find_channel("system-broadcast").unwrap().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    for agent in ["a", "b", "c"] {
        broker.join_channel(&system, agent).unwrap();
        broker.subscribe(agent, "shutdown", counting(&hits)).unwrap();
    }

    broker
        .send_to_channel(&system, "a", "shutdown", json!({}))
        .unwrap();
    // Nobody subscribes to "maintenance", so every copy waits in an inbox.
    broker.join_channel(&system, "d").unwrap();
    broker
        .send_to_channel(&system, "a", "maintenance", json!({}))
        .unwrap();

    wait_until(|| hits.load(Ordering::SeqCst) >= 2).await;
    wait_until(|| broker.get_metrics().inbox_messages == 3).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(broker.poll_messages("d", 10).unwrap().len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Concurrency
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_complete_with_distinct_ids_and_consistent_metrics() {
    let broker = running(CommsConfig::default());
    let hits = Arc::new(AtomicUsize::new(0));
    for n in 0..4 {
        broker
            .subscribe(&format!("worker-{n}"), "task", counting(&hits))
            .unwrap();
    }

    let mut handles = Vec::new();
    for n in 0..100 {
        let broker = Arc::clone(&broker);
        handles.push(tokio::spawn(async move {
            broker.send_message("lead", &format!("worker-{}", n % 4), "task", json!({ "n": n }))
        }));
    }

    let ids = tokio::time::timeout(Duration::from_secs(5), async {
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids
    })
    .await
    .expect("sends complete in bounded time");

    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 100);
    wait_until(|| broker.get_metrics().messages_delivered >= 100).await;

    let metrics = broker.get_metrics();
    assert_eq!(hits.load(Ordering::SeqCst), 100);
    assert_eq!(metrics.messages_sent, 100);
    assert_eq!(metrics.messages_delivered, 100);
    assert_eq!(metrics.messages_failed, 0);
    assert_eq!(metrics.agents, 4);
    assert_eq!(metrics.subscriptions, 4);
    assert_eq!(metrics.pending_acks, 100);
    assert_eq!(metrics.retained_messages, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_recipient_order_holds_across_lanes() {
    let broker = running(CommsConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    broker
        .subscribe(
            "worker",
            "step",
            handler_fn(move |message| {
                let sink = Arc::clone(&sink);
                async move {
                    // Uneven handler latency must not reorder the lane.
                    let n = message.payload["n"].as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis((7 - n % 7) * 2)).await;
                    sink.lock().push(n);
                    Ok(())
                }
            }),
        )
        .unwrap();

    for n in 0..25_u64 {
        broker
            .send_message("lead", "worker", "step", json!({ "n": n }))
            .unwrap();
    }
    wait_until(|| seen.lock().len() == 25).await;
    assert_eq!(*seen.lock(), (0..25).collect::<Vec<u64>>());
}
