//! Two agents on an in-process mesh
//!
//! This example shows:
//! - Registering agent cards with a shared discovery service
//! - Command RPC (`ping` -> `pong`)
//! - Topic routing with a wildcard subscription
//!
//! Run with: RUST_LOG=ossa_mesh=debug cargo run --example ping_pong

use ossa_mesh::{
    AgentAddress, AgentCard, Discovery, HandlerError, InMemoryNetwork, InMemoryTransport,
    MeshClient, MessageEnvelope, RoutingRule, Subscription, TransportKind,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

async fn start_agent(
    address: &str,
    endpoint: &str,
    discovery: &Arc<Discovery>,
    network: &InMemoryNetwork,
) -> Result<MeshClient, Box<dyn std::error::Error>> {
    let parsed = AgentAddress::parse(address)?;
    let card = AgentCard::new(&parsed, parsed.name(), "1.0.0")
        .with_capability("demo")
        .with_endpoint(TransportKind::Memory, endpoint);

    let client = MeshClient::builder(card)
        .discovery(Arc::clone(discovery))
        .transport(InMemoryTransport::new(network.clone()))
        .start()
        .await?;
    client.listen(network.register(endpoint))?;
    Ok(client)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let discovery = Arc::new(Discovery::new());
    let network = InMemoryNetwork::new();

    let ping = start_agent("agent://demo/ping", "mem://ping", &discovery, &network).await?;
    let pong = start_agent("agent://demo/pong", "mem://pong", &discovery, &network).await?;
    info!(agents = discovery.list().await?.len(), "Agents registered");

    pong.register_command("ping", |input: Value| async move {
        Ok::<Value, HandlerError>(json!({ "reply": "pong", "echo": input }))
    });

    let answer = ping
        .invoke_command("agent://demo/pong", "ping", json!({"n": 1}), Some(Duration::from_secs(2)))
        .await?;
    info!(%answer, "Command answered");

    pong.subscribe(
        Subscription::new("scores.*", "score-logger"),
        |envelope: MessageEnvelope| async move {
            info!(to = %envelope.to, payload = %envelope.payload, "Score update");
            Ok::<(), HandlerError>(())
        },
    );
    ping.add_rule(RoutingRule::new("scores.match", vec!["agent://demo/pong".to_string()]))?;
    ping.publish("scores.match", json!({"ping": 11, "pong": 9})).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = ping.stats().await;
    info!(
        sent = stats.metrics.messages_sent_total,
        delivered = stats.metrics.deliveries_total,
        topic_routed = stats.routing.topic_routed,
        "Ping stats"
    );

    ping.close().await;
    pong.close().await;
    Ok(())
}
