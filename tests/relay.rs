//! End-to-end relay tests against a fake upstream

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tower::ServiceExt;

mod common;
use common::{FakeUpstream, STEP, dead_url, plaintext_wss_url, relay_config, spawn_relay};

type ClientStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect_client(url: &str) -> ClientStream {
    let (ws, _) = timeout(STEP, tokio_tungstenite::connect_async(url))
        .await
        .expect("client connect timed out")
        .expect("client connect failed");
    ws
}

/// Next data or close message, skipping control frames
async fn next_message<S>(ws: &mut S) -> Message
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = timeout(STEP, ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("stream error");
        if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
            return msg;
        }
    }
}

fn close_of(msg: Message) -> (u16, String) {
    match msg {
        Message::Close(Some(frame)) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_frames_sent_before_upstream_opens_arrive_in_order() {
    let upstream = FakeUpstream::bind().await;
    let url = spawn_relay(relay_config(&upstream.url(), None)).await;
    let mut client = connect_client(&url).await;

    for text in ["one", "two", "three"] {
        client.send(Message::text(text)).await.unwrap();
    }

    let mut up = upstream.accept(Duration::from_millis(200)).await;
    for expected in ["one", "two", "three"] {
        assert_eq!(next_message(&mut up).await, Message::text(expected));
    }

    client.send(Message::text("four")).await.unwrap();
    assert_eq!(next_message(&mut up).await, Message::text("four"));

    // replies flow back unchanged
    up.send(Message::text("{\"setupComplete\":{}}")).await.unwrap();
    assert_eq!(
        next_message(&mut client).await,
        Message::text("{\"setupComplete\":{}}")
    );
}

#[tokio::test]
async fn test_binary_frames_are_forwarded() {
    let upstream = FakeUpstream::bind().await;
    let url = spawn_relay(relay_config(&upstream.url(), None)).await;
    let mut client = connect_client(&url).await;
    let mut up = upstream.accept(Duration::ZERO).await;

    let payload = bytes::Bytes::from_static(&[0, 1, 2, 255]);
    client.send(Message::Binary(payload.clone())).await.unwrap();
    assert_eq!(next_message(&mut up).await, Message::Binary(payload));
}

/// Read until the close frame, returning it and any data frames seen first
async fn drain_until_close<S>(ws: &mut S) -> ((u16, String), Vec<Message>)
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut data = Vec::new();
    loop {
        match next_message(ws).await {
            msg @ Message::Close(_) => return (close_of(msg), data),
            other => data.push(other),
        }
    }
}

#[tokio::test]
async fn test_unreachable_upstream_closes_client_with_internal_error() {
    let config = relay_config(&dead_url().await, None);
    let expected = match avatar_gateway::relay::connect_upstream(&config).await {
        Ok(_) => panic!("dead upstream accepted a connection"),
        Err(e) => format!("upstream error: {e}"),
    };

    let url = spawn_relay(config).await;
    let mut client = connect_client(&url).await;

    client.send(Message::text("hello")).await.unwrap();

    let ((code, reason), data) = drain_until_close(&mut client).await;
    assert_eq!(code, 1011);
    assert!(
        expected.starts_with(&reason) && reason.len() > "upstream error: ".len(),
        "reason {reason:?} does not carry the connect error {expected:?}"
    );
    assert!(data.is_empty(), "frames before close: {data:?}");
}

#[tokio::test]
async fn test_tls_upstream_failure_closes_client() {
    let url = spawn_relay(relay_config(&plaintext_wss_url().await, None)).await;
    let mut client = connect_client(&url).await;

    client.send(Message::text("hello")).await.unwrap();

    let ((code, reason), data) = drain_until_close(&mut client).await;
    assert_eq!(code, 1011);
    assert!(reason.starts_with("upstream error: "), "reason: {reason}");
    assert!(data.is_empty(), "frames before close: {data:?}");
}

#[tokio::test]
async fn test_upstream_close_code_reaches_client() {
    let upstream = FakeUpstream::bind().await;
    let url = spawn_relay(relay_config(&upstream.url(), None)).await;
    let mut client = connect_client(&url).await;
    let mut up = upstream.accept(Duration::ZERO).await;

    up.close(Some(CloseFrame {
        code: CloseCode::from(4001),
        reason: "quota exhausted".into(),
    }))
    .await
    .unwrap();

    let (code, reason) = close_of(next_message(&mut client).await);
    assert_eq!(code, 4001);
    assert_eq!(reason, "quota exhausted");
}

#[tokio::test]
async fn test_client_close_reaches_upstream() {
    let upstream = FakeUpstream::bind().await;
    let url = spawn_relay(relay_config(&upstream.url(), None)).await;
    let mut client = connect_client(&url).await;
    let mut up = upstream.accept(Duration::ZERO).await;

    client
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "done".into(),
        }))
        .await
        .unwrap();

    let (code, reason) = close_of(next_message(&mut up).await);
    assert_eq!(code, 1000);
    assert_eq!(reason, "done");
}

#[tokio::test]
async fn test_pending_buffer_overflow_closes_with_policy_violation() {
    let upstream = FakeUpstream::bind().await;
    let url = spawn_relay(relay_config(&upstream.url(), Some(2))).await;
    let mut client = connect_client(&url).await;

    for text in ["a", "b", "c"] {
        client.send(Message::text(text)).await.unwrap();
    }

    let (code, _) = close_of(next_message(&mut client).await);
    assert_eq!(code, 1008);
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = avatar_gateway::ApiServer::new(relay_config("ws://127.0.0.1:1/", None));
    let response = server
        .router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_unknown_path_is_not_upgraded() {
    let url = spawn_relay(relay_config("ws://127.0.0.1:1/", None)).await;
    let wrong = url.replace(common::RELAY_PATH, "/elsewhere");
    let result = timeout(STEP, tokio_tungstenite::connect_async(wrong))
        .await
        .expect("connect timed out");
    assert!(result.is_err());
}
