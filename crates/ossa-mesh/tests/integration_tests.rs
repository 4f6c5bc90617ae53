//! End-to-end scenarios over the in-process transport

use ossa_mesh::{
    AgentAddress, AgentCard, ClientConfig, DeadLetterConfig, Discovery, HandlerError,
    InMemoryNetwork, InMemoryTransport, MeshClient, MeshError, MeshEvent, MessageEnvelope,
    MessageFilter, MessageType, Priority, RoutingRule, Subscription, TransportKind,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::timeout;

struct Mesh {
    discovery: Arc<Discovery>,
    network: InMemoryNetwork,
}

impl Mesh {
    fn new() -> Self {
        Self {
            discovery: Arc::new(Discovery::new()),
            network: InMemoryNetwork::new(),
        }
    }

    fn endpoint(address: &str) -> String {
        format!("mem://{}", address.trim_start_matches("agent://"))
    }

    /// Start a client that processes its inbox
    async fn agent(&self, address: &str) -> MeshClient {
        self.agent_with(address, ClientConfig::default()).await
    }

    async fn agent_with(&self, address: &str, config: ClientConfig) -> MeshClient {
        let endpoint = Self::endpoint(address);
        let inbox = self.network.register(&endpoint);
        let client = self.start(address, &endpoint, config).await;
        client.listen(inbox).unwrap();
        client
    }

    /// Start a client whose inbox the test reads directly
    async fn raw_agent(&self, address: &str) -> (MeshClient, mpsc::Receiver<MessageEnvelope>) {
        let endpoint = Self::endpoint(address);
        let inbox = self.network.register(&endpoint);
        let client = self.start(address, &endpoint, ClientConfig::default()).await;
        (client, inbox)
    }

    async fn start(&self, address: &str, endpoint: &str, config: ClientConfig) -> MeshClient {
        let parsed = AgentAddress::parse(address).unwrap();
        let card = AgentCard::new(&parsed, parsed.name(), "1.0.0")
            .with_endpoint(TransportKind::Memory, endpoint);
        MeshClient::builder(card)
            .config(config)
            .discovery(Arc::clone(&self.discovery))
            .transport(InMemoryTransport::new(self.network.clone()))
            .start()
            .await
            .unwrap()
    }
}

/// Subscription handler that records every payload it sees
fn recorder(
    client: &MeshClient,
    channel: &str,
    handler_id: &str,
) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client.subscribe(
        Subscription::new(channel, handler_id),
        move |envelope: MessageEnvelope| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().await.push(envelope.payload);
                Ok::<(), HandlerError>(())
            }
        },
    );
    seen
}

async fn wait_for_len(seen: &Arc<Mutex<Vec<Value>>>, expected: usize) {
    timeout(Duration::from_secs(5), async {
        while seen.lock().await.len() < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for deliveries");
}

async fn next_event(
    events: &mut broadcast::Receiver<MeshEvent>,
    name: &str,
) -> MeshEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(event) = events.recv().await
                && event.name() == name
            {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {name} event"))
}

#[tokio::test]
async fn test_direct_message_delivered_once() {
    let mesh = Mesh::new();
    let a = mesh.agent("agent://ns/a").await;
    let b = mesh.agent("agent://ns/b").await;
    let seen = recorder(&b, "agent://ns/b", "inbox");

    a.send(a.envelope("agent://ns/b", MessageType::Event, json!({"x": 1})).build())
        .await
        .unwrap();

    wait_for_len(&seen, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["x"], 1);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_command_request_response() {
    let mesh = Mesh::new();
    let a = mesh.agent("agent://ns/a").await;
    let b = mesh.agent("agent://ns/b").await;
    b.register_command("ping", |_input: Value| async move {
        Ok::<Value, HandlerError>(json!("pong"))
    });

    let answer = a
        .invoke_command("agent://ns/b", "ping", Value::Null, Some(Duration::from_millis(1000)))
        .await
        .unwrap();
    assert_eq!(answer, json!("pong"));
    assert_eq!(a.pending_requests(), 0);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_remote_command_error() {
    let mesh = Mesh::new();
    let a = mesh.agent("agent://ns/a").await;
    let b = mesh.agent("agent://ns/b").await;
    b.register_command("divide", |input: Value| async move {
        let divisor = input["by"].as_i64().unwrap_or(0);
        if divisor == 0 {
            return Err::<Value, HandlerError>("division by zero".into());
        }
        Ok(json!(100 / divisor))
    });

    let ok = a
        .invoke_command("agent://ns/b", "divide", json!({"by": 4}), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(ok, json!(25));

    let err = a
        .invoke_command("agent://ns/b", "divide", json!({"by": 0}), Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Remote { .. }));
    assert!(err.to_string().contains("division by zero"));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_request_answered_by_subscription() {
    let mesh = Mesh::new();
    let a = mesh.agent("agent://ns/a").await;
    let b = mesh.agent("agent://ns/b").await;

    let responder = b.clone();
    b.subscribe(
        Subscription::new("agent://ns/b", "echo"),
        move |envelope: MessageEnvelope| {
            let responder = responder.clone();
            async move {
                let reply = json!({"echo": envelope.payload});
                responder.respond(&envelope, reply).await?;
                Ok::<(), HandlerError>(())
            }
        },
    );

    let reply = a
        .request("agent://ns/b", json!({"q": "hi"}), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(reply["echo"]["q"], "hi");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_request_to_unknown_agent_times_out() {
    let mesh = Mesh::new();
    let a = mesh.agent("agent://ns/a").await;
    let mut events = a.events();

    let err = a
        .request("agent://ns/nobody", json!({}), Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Timeout(_)));
    assert_eq!(a.pending_requests(), 0);

    match next_event(&mut events, "request:timeout").await {
        MeshEvent::RequestTimeout { to, .. } => assert_eq!(to, "agent://ns/nobody"),
        other => panic!("unexpected event {other:?}"),
    }
    a.close().await;
}

#[tokio::test]
async fn test_abandoned_request_releases_pending_entry() {
    let mesh = Mesh::new();
    let a = mesh.agent("agent://ns/a").await;

    let requester = a.clone();
    let task = tokio::spawn(async move {
        requester
            .request("agent://ns/nobody", json!({"q": "ping"}), Some(Duration::from_millis(200)))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.pending_requests(), 1);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(a.pending_requests(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.pending_requests(), 0);
    a.close().await;
}

#[tokio::test]
async fn test_broadcast_reaches_namespace() {
    let mesh = Mesh::new();
    let a = mesh.agent("agent://ns/a").await;
    let mut peers = Vec::new();
    let mut seen = Vec::new();
    for name in ["b", "c", "d"] {
        let peer = mesh.agent(&format!("agent://ns/{name}")).await;
        seen.push(recorder(&peer, "ns.*", "broadcasts"));
        peers.push(peer);
    }
    // Different namespace, must not receive
    let outsider = mesh.agent("agent://other/e").await;
    let outsider_seen = recorder(&outsider, "**", "everything");
    let own_seen = recorder(&a, "**", "everything");

    let mut events = a.events();
    a.broadcast("ns", json!({"announcement": "hello"})).await.unwrap();

    for recorded in &seen {
        wait_for_len(recorded, 1).await;
        assert_eq!(recorded.lock().await[0]["announcement"], "hello");
    }

    let mut delivered = Vec::new();
    for _ in 0..3 {
        if let MeshEvent::MessageDelivered { destination, .. } =
            next_event(&mut events, "message:delivered").await
        {
            delivered.push(destination);
        }
    }
    delivered.sort();
    assert_eq!(delivered, vec!["agent://ns/b", "agent://ns/c", "agent://ns/d"]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(outsider_seen.lock().await.is_empty());
    assert!(own_seen.lock().await.is_empty());
    assert_eq!(a.stats().await.metrics.messages_broadcast_total, 1);

    a.close().await;
    outsider.close().await;
    for peer in peers {
        peer.close().await;
    }
}

#[tokio::test]
async fn test_expired_message_never_delivered() {
    let mesh = Mesh::new();
    let a = mesh.agent("agent://ns/a").await;
    let (b, mut inbox) = mesh.raw_agent("agent://ns/b").await;
    let mut events = a.events();

    let mut stale = a
        .envelope("agent://ns/b", MessageType::Event, json!({"x": 1}))
        .with_ttl(1)
        .build();
    stale.timestamp = chrono::Utc::now() - chrono::Duration::seconds(5);
    let id = a.send(stale).await.unwrap();

    match next_event(&mut events, "message:expired").await {
        MeshEvent::MessageExpired { message_id, .. } => assert_eq!(message_id, id.to_string()),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(
        timeout(Duration::from_millis(100), inbox.recv())
            .await
            .is_err()
    );
    let stats = a.stats().await;
    assert_eq!(stats.metrics.expired_total, 1);
    // Dropped before any route lookup
    assert_eq!(stats.routing.direct_routed, 0);
    assert_eq!(stats.routing.topic_routed, 0);
    assert_eq!(stats.routing.broadcast_routed, 0);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_duplicate_subscription_invoked_once() {
    let mesh = Mesh::new();
    let a = mesh.agent("agent://ns/a").await;
    let b = mesh.agent("agent://ns/b").await;

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let counter = Arc::clone(&hits);
        b.subscribe(
            Subscription::new("agent://ns/b", "same-handler"),
            move |_envelope: MessageEnvelope| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            },
        );
    }

    a.send(a.envelope("agent://ns/b", MessageType::Event, json!({})).build())
        .await
        .unwrap();
    timeout(Duration::from_secs(5), async {
        while hits.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_topic_rule_with_filter() {
    let mesh = Mesh::new();
    let a = mesh.agent("agent://ns/a").await;
    let b = mesh.agent("agent://ns/b").await;
    let c = mesh.agent("agent://ns/c").await;
    let b_seen = recorder(&b, "orders.*", "orders");
    let c_seen = recorder(&c, "orders.*", "orders");

    a.add_rule(RoutingRule::new("topic://orders.created", vec!["agent://ns/b".into()]))
        .unwrap();
    a.add_rule(
        RoutingRule::new("orders.created", vec!["agent://ns/c".into()])
            .with_filter(MessageFilter::new().with_expression("total > 100")),
    )
    .unwrap();

    a.publish("orders.created", json!({"total": 50})).await.unwrap();
    a.publish("topic://orders.created", json!({"total": 500}))
        .await
        .unwrap();

    wait_for_len(&b_seen, 2).await;
    wait_for_len(&c_seen, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(c_seen.lock().await.as_slice(), &[json!({"total": 500})]);

    let stats = a.stats().await;
    assert_eq!(stats.routing.total_rules, 2);
    assert_eq!(stats.routing.topic_routed, 2);
    assert_eq!(stats.metrics.channel_counts["orders.created"], 2);

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn test_priority_order_across_ticks() {
    let mesh = Mesh::new();
    let mut config = ClientConfig {
        tick_interval: Duration::from_millis(200),
        ..ClientConfig::default()
    };
    config.reliability.ordering = Some(ossa_mesh::OrderingConfig { enabled: true });
    let a = mesh.agent_with("agent://ns/a", config).await;
    let (b, mut inbox) = mesh.raw_agent("agent://ns/b").await;

    // Let the scheduler's immediate first tick pass
    tokio::time::sleep(Duration::from_millis(50)).await;
    for (priority, n) in [(Priority::Low, 1), (Priority::Normal, 2), (Priority::Urgent, 3)] {
        a.send(
            a.envelope("agent://ns/b", MessageType::Event, json!({"n": n}))
                .with_priority(priority)
                .build(),
        )
        .await
        .unwrap();
    }

    let mut order = Vec::new();
    for _ in 0..3 {
        let envelope = timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        order.push(envelope.payload["n"].as_u64().unwrap());
    }
    assert_eq!(order, vec![3, 2, 1]);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_dead_letter_and_replay() {
    let mesh = Mesh::new();
    let mut config = ClientConfig::default();
    config.reliability.dead_letter = Some(DeadLetterConfig {
        channel: "topic://mesh.dlq".into(),
        ..DeadLetterConfig::default()
    });
    let a = mesh.agent_with("agent://ns/a", config).await;
    let monitor = mesh.agent("agent://ops/monitor").await;
    let dlq_seen = recorder(&monitor, "mesh.dlq", "dlq");
    a.add_rule(RoutingRule::new("mesh.dlq", vec!["agent://ops/monitor".into()]))
        .unwrap();
    let mut events = a.events();

    let id = a
        .send(a.envelope("agent://ns/late", MessageType::Event, json!({"x": 1})).build())
        .await
        .unwrap();

    match next_event(&mut events, "message:failed").await {
        MeshEvent::MessageFailed { message_id, code, .. } => {
            assert_eq!(message_id, id.to_string());
            assert_eq!(code, ossa_mesh::A2aErrorCode::AgentNotFound);
        }
        other => panic!("unexpected event {other:?}"),
    }
    next_event(&mut events, "message:dead-lettered").await;

    // The wrapper is published to the dead-letter topic
    wait_for_len(&dlq_seen, 1).await;
    {
        let wrappers = dlq_seen.lock().await;
        assert_eq!(wrappers[0]["original"]["id"], id.to_string());
        assert_eq!(wrappers[0]["destination"], "agent://ns/late");
    }

    // Once the destination exists the record can be replayed
    let late = mesh.agent("agent://ns/late").await;
    let late_seen = recorder(&late, "agent://ns/late", "inbox");
    assert_eq!(a.replay_dead_letter(id.as_str()).await.unwrap(), 1);
    wait_for_len(&late_seen, 1).await;
    assert_eq!(late_seen.lock().await[0]["x"], 1);
    assert_eq!(a.dead_letters().unwrap().size().await, 0);

    a.close().await;
    monitor.close().await;
    late.close().await;
}

#[tokio::test]
async fn test_closed_peer_becomes_unreachable() {
    let mesh = Mesh::new();
    let a = mesh.agent("agent://ns/a").await;
    let b = mesh.agent("agent://ns/b").await;
    assert_eq!(mesh.discovery.list_namespace("ns").await.unwrap().len(), 2);

    b.close().await;
    assert_eq!(mesh.discovery.list_namespace("ns").await.unwrap().len(), 1);

    let mut events = a.events();
    a.send(a.envelope("agent://ns/b", MessageType::Event, json!({})).build())
        .await
        .unwrap();
    match next_event(&mut events, "message:failed").await {
        MeshEvent::MessageFailed { destination, .. } => assert_eq!(destination, "agent://ns/b"),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(a.dead_letters().is_none());
    a.close().await;
}
