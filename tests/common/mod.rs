//! Shared test utilities

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use avatar_gateway::ApiServer;
use avatar_gateway::config::RelayConfig;
use secrecy::SecretString;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;

/// Path the test relay serves client legs on
pub const RELAY_PATH: &str = "/relay";

/// Upper bound for any single step in a test
pub const STEP: Duration = Duration::from_secs(5);

/// Relay configuration pointing at `upstream_url`
#[must_use]
pub fn relay_config(upstream_url: &str, max_pending_frames: Option<usize>) -> RelayConfig {
    RelayConfig {
        port: 0,
        path: RELAY_PATH.to_string(),
        upstream_url: upstream_url.to_string(),
        api_key: Some(SecretString::from("test-key")),
        egress: None,
        max_pending_frames,
    }
}

/// Start a relay on an ephemeral port and return its client URL
pub async fn spawn_relay(config: RelayConfig) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind relay");
    let addr = listener.local_addr().expect("no local addr");
    tokio::spawn(ApiServer::new(config).serve(listener));
    format!("ws://{addr}{RELAY_PATH}")
}

/// A WebSocket server standing in for the speech service
pub struct FakeUpstream {
    listener: TcpListener,
    addr: SocketAddr,
}

impl FakeUpstream {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind upstream");
        let addr = listener.local_addr().expect("no local addr");
        Self { listener, addr }
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Accept one connection, holding the handshake back for `delay`
    pub async fn accept(&self, delay: Duration) -> WebSocketStream<TcpStream> {
        let (tcp, _) = self.listener.accept().await.expect("accept failed");
        tokio::time::sleep(delay).await;
        tokio_tungstenite::accept_async(tcp)
            .await
            .expect("upstream handshake failed")
    }
}

/// An address nothing is listening on
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("no local addr");
    drop(listener);
    format!("ws://{addr}/")
}

/// A `wss://` address whose server answers in plain text instead of TLS
pub async fn plaintext_wss_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("no local addr");
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        }
    });
    format!("wss://{addr}/")
}
