//! HTTP transport against a mock agent endpoint

#![cfg(feature = "http")]

use ossa_mesh::{
    AgentAddress, AgentCard, ClientConfig, Discovery, EnvelopeBuilder, HttpTransport, MeshClient,
    MeshError, MeshEvent, MessageType, TraceContext, Transport, TransportKind,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn envelope() -> ossa_mesh::MessageEnvelope {
    EnvelopeBuilder::event("agent://ns/a", "agent://ns/b", json!({"x": 1})).build()
}

#[tokio::test]
async fn test_post_delivers_envelope() {
    let mock_server = MockServer::start().await;
    let trace = TraceContext::new_root();
    let envelope = EnvelopeBuilder::event("agent://ns/a", "agent://ns/b", json!({"x": 1}))
        .with_trace(trace.clone())
        .build();

    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("traceparent", trace.traceparent.as_str()))
        .and(header_exists("user-agent"))
        .and(body_partial_json(json!({
            "id": envelope.id.to_string(),
            "from": "agent://ns/a",
            "payload": {"x": 1}
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&mock_server)
        .await;

    let transport = HttpTransport::new().unwrap();
    assert_eq!(transport.kind(), TransportKind::Http);
    transport.send(&mock_server.uri(), &envelope).await.unwrap();
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&mock_server)
        .await;

    let transport = HttpTransport::new().unwrap();
    let err = transport
        .send(&mock_server.uri(), &envelope())
        .await
        .unwrap_err();

    assert!(matches!(err, MeshError::Transport { status: Some(503), .. }));
    assert!(err.is_retryable());
    assert!(err.to_string().contains("overloaded"));
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
        .mount(&mock_server)
        .await;

    let transport = HttpTransport::new().unwrap();
    let err = transport
        .send(&mock_server.uri(), &envelope())
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(3));
    assert_eq!(err.code(), ossa_mesh::A2aErrorCode::RateLimited);
}

#[tokio::test]
async fn test_client_error_is_retryable() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad envelope"))
        .mount(&mock_server)
        .await;

    let transport = HttpTransport::new().unwrap();
    let err = transport
        .send(&mock_server.uri(), &envelope())
        .await
        .unwrap_err();

    assert!(matches!(err, MeshError::Transport { status: Some(400), .. }));
    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), None);
}

#[tokio::test]
async fn test_timeout_is_transport_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&mock_server)
        .await;

    let transport = HttpTransport::with_timeout(Duration::from_millis(50)).unwrap();
    let err = transport
        .send(&mock_server.uri(), &envelope())
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn test_client_delivers_over_http_with_retry() {
    let mock_server = MockServer::start().await;

    // First attempt fails, the retry succeeds
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(body_partial_json(json!({"metadata": {"retryCount": 1}})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let discovery = Arc::new(Discovery::new());
    let remote = AgentAddress::parse("agent://ns/remote").unwrap();
    discovery
        .register_self(
            AgentCard::new(&remote, "remote", "1.0.0")
                .with_endpoint(TransportKind::Http, mock_server.uri()),
        )
        .await
        .unwrap();

    let mut config = ClientConfig::default();
    config.reliability.retry.initial_delay_ms = 20;
    config.reliability.retry.max_delay_ms = 100;
    let local = AgentAddress::parse("agent://ns/local").unwrap();
    let client = MeshClient::builder(AgentCard::new(&local, "local", "1.0.0"))
        .config(config)
        .discovery(Arc::clone(&discovery))
        .transport(HttpTransport::new().unwrap())
        .start()
        .await
        .unwrap();
    let mut events = client.events();

    client
        .send(client.envelope("agent://ns/remote", MessageType::Event, json!({"x": 1})).build())
        .await
        .unwrap();

    let attempts = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(MeshEvent::MessageDelivered { attempts, .. }) = events.recv().await {
                break attempts;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(attempts, 2);
    assert_eq!(client.stats().await.metrics.retries_total, 1);

    client.close().await;
}
