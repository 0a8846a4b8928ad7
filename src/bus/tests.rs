use super::*;
use serde_json::json;

fn envelope(event_type: &str) -> Envelope {
    Envelope::new(event_type, json!({}))
}

#[tokio::test]
async fn delivers_to_matching_subscriber() {
    let bus = EventBus::new();
    let sub = bus
        .subscribe(SubscriptionFilter::topic("message.received"), "t")
        .await;

    let report = bus
        .emit(envelope("message.received").with_channel("ch1"))
        .await;
    assert_eq!(report.delivered, 1);
    assert!(report.failed.is_empty());

    let received = sub.recv().await.unwrap();
    assert_eq!(received.event_type, "message.received");
    assert_eq!(received.channel_id.as_deref(), Some("ch1"));
}

#[tokio::test]
async fn topic_prefix_wildcard_matches() {
    let bus = EventBus::new();
    let sub = bus.subscribe(SubscriptionFilter::topic("task.*"), "t").await;

    bus.emit(envelope("task.created")).await;
    bus.emit(envelope("message.received")).await;
    bus.emit(envelope("task.completed")).await;

    assert_eq!(sub.recv().await.unwrap().event_type, "task.created");
    assert_eq!(sub.recv().await.unwrap().event_type, "task.completed");
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn channel_filter_excludes_other_channels() {
    let bus = EventBus::new();
    let sub = bus.subscribe(SubscriptionFilter::channel("ch-a"), "t").await;

    bus.emit(envelope("message.received").with_channel("ch-b"))
        .await;
    bus.emit(envelope("message.received").with_channel("ch-a"))
        .await;
    // Channel-less events never match a channel-filtered view.
    bus.emit(envelope("message.received")).await;

    let received = sub.recv().await.unwrap();
    assert_eq!(received.channel_id.as_deref(), Some("ch-a"));
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn public_only_subscriber_never_sees_internal_events() {
    let bus = EventBus::new();
    let sub = bus
        .subscribe_public(SubscriptionFilter::default(), "session")
        .await;

    bus.emit(envelope("session.created")).await;
    bus.emit(envelope("task.internal.sweep")).await;
    bus.emit(envelope("agent.connected")).await;

    assert_eq!(sub.recv().await.unwrap().event_type, "agent.connected");
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn drop_oldest_overflow_keeps_newest() {
    let bus = EventBus::with_capacity(2, std::time::Duration::from_millis(50));
    let sub = bus
        .subscribe(SubscriptionFilter::topic("controlloop.*"), "t")
        .await;

    for i in 0..4 {
        bus.emit(
            Envelope::new("controlloop.reasoning", json!({ "seq": i })),
        )
        .await;
    }

    // Capacity 2: the two oldest were dropped.
    assert_eq!(sub.recv().await.unwrap().data["seq"], 2);
    assert_eq!(sub.recv().await.unwrap().data["seq"], 3);
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn blocking_overflow_reports_send_failure() {
    let bus = EventBus::with_capacity(1, std::time::Duration::from_millis(20));
    let _sub = bus
        .subscribe(SubscriptionFilter::topic("message.*"), "slow")
        .await;

    let first = bus.emit(envelope("message.received")).await;
    assert_eq!(first.delivered, 1);

    // Inbox is full and nobody is reading: the blocking class times out.
    let second = bus.emit(envelope("message.received")).await;
    assert_eq!(second.delivered, 0);
    assert_eq!(second.failed.len(), 1);
    assert_eq!(second.failed[0].message, "MESSAGE_SEND_FAILED");
}

#[tokio::test]
async fn failed_subscriber_does_not_block_others() {
    let bus = EventBus::with_capacity(1, std::time::Duration::from_millis(20));
    let full = bus
        .subscribe(SubscriptionFilter::topic("message.*"), "full")
        .await;
    // Pre-fill the first inbox.
    bus.emit(envelope("message.received")).await;
    assert!(full.try_recv().is_some());
    bus.emit(envelope("message.received")).await;

    let healthy = bus
        .subscribe(SubscriptionFilter::topic("message.*"), "healthy")
        .await;
    let report = bus.emit(envelope("message.received")).await;

    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed.len(), 1);
    assert!(healthy.try_recv().is_some());
}

#[tokio::test]
async fn dropping_subscription_prunes_subscriber() {
    let bus = EventBus::new();
    let sub = bus.subscribe(SubscriptionFilter::default(), "t").await;
    assert_eq!(bus.subscriber_count().await, 1);

    drop(sub);
    bus.emit(envelope("message.received")).await;
    assert_eq!(bus.subscriber_count().await, 0);
}

#[tokio::test]
async fn ordering_preserved_per_emitter() {
    let bus = EventBus::new();
    let sub = bus
        .subscribe(SubscriptionFilter::channel("ch"), "t")
        .await;

    for i in 0..10 {
        bus.emit(Envelope::new("message.received", json!({ "seq": i })).with_channel("ch"))
            .await;
    }
    for i in 0..10 {
        assert_eq!(sub.recv().await.unwrap().data["seq"], i);
    }
}

#[tokio::test]
async fn channel_bus_injects_channel_and_agent() {
    let bus = Arc::new(EventBus::new());
    let view = ChannelBus::new(bus.clone(), "ch-1", "agent-1");
    let sub = bus.subscribe(SubscriptionFilter::channel("ch-1"), "t").await;

    // Even an envelope claiming another channel is rewritten.
    view.emit(envelope("message.sent").with_channel("ch-other"))
        .await;

    let received = sub.recv().await.unwrap();
    assert_eq!(received.channel_id.as_deref(), Some("ch-1"));
    assert_eq!(received.agent_id.as_deref(), Some("agent-1"));
}

#[tokio::test]
async fn channel_bus_on_scopes_subscription() {
    let bus = Arc::new(EventBus::new());
    let view = ChannelBus::new(bus.clone(), "ch-1", "agent-1");
    let sub = view.on("message.*").await;

    bus.emit(envelope("message.received").with_channel("ch-2"))
        .await;
    bus.emit(envelope("message.received").with_channel("ch-1"))
        .await;

    let received = sub.recv().await.unwrap();
    assert_eq!(received.channel_id.as_deref(), Some("ch-1"));
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn monitor_receives_whitelisted_channel_events_once() {
    let bus = Arc::new(EventBus::new());
    let monitor = ChannelMonitor::attach(&bus, "ch-a").await;

    bus.emit(envelope("mcp.tool_call").with_channel("ch-a")).await;
    bus.emit(envelope("mcp.tool_call").with_channel("ch-b")).await;
    bus.emit(envelope("session.created").with_channel("ch-a"))
        .await;

    let received = monitor.recv().await.unwrap();
    assert_eq!(received.event_type, "mcp.tool_call");
    assert_eq!(received.channel_id.as_deref(), Some("ch-a"));
    assert!(monitor.try_recv().is_none());
}
