//! Upstream connection, optionally tunnelled through an HTTP `CONNECT` proxy

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Once;

use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::{EgressConfig, RelayConfig};
use crate::{Error, Result};

/// Upper bound on a proxy response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// WebSocket connection to the speech service
pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the process-wide TLS crypto provider if nobody has yet
///
/// `wss://` handshakes cannot pick a provider on their own, so every TLS
/// connect path calls this first. An already installed provider is kept.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("tls crypto provider already installed");
        }
    });
}

/// Open the upstream leg, through the egress proxy when one is configured
///
/// # Errors
///
/// Returns error if the proxy or the service is unreachable, the proxy
/// refuses the tunnel, or the WebSocket handshake is rejected
pub async fn connect_upstream(relay: &RelayConfig) -> Result<UpstreamStream> {
    let url = relay.upstream_request_url()?;
    ensure_crypto_provider();

    let Some(egress) = &relay.egress else {
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        return Ok(stream);
    };

    let host = url
        .host_str()
        .ok_or_else(|| Error::Config("upstream url has no host".to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Config("upstream url has no port".to_string()))?;

    tracing::debug!(proxy = %egress.host, target = %host, "opening egress tunnel");
    let tunnel = open_tunnel(egress, host, port).await?;
    let (stream, _) = tokio_tungstenite::client_async_tls(url.as_str(), tunnel).await?;
    Ok(stream)
}

/// Connect to the proxy and ask it for a tunnel to `host:port`
async fn open_tunnel(egress: &EgressConfig, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((egress.host.as_str(), egress.port))
        .await
        .map_err(|e| {
            Error::Transport(format!(
                "egress proxy {}:{} unreachable: {e}",
                egress.host, egress.port
            ))
        })?;

    stream
        .write_all(connect_request(egress, host, port).as_bytes())
        .await?;

    let head = read_response_head(&mut stream).await?;
    let status = parse_status(&head)?;
    if !(200..300).contains(&status) {
        let line = head.lines().next().unwrap_or_default();
        return Err(Error::Transport(format!("egress proxy refused tunnel: {line}")));
    }

    Ok(stream)
}

fn connect_request(egress: &EgressConfig, host: &str, port: u16) -> String {
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(user) = &egress.username {
        let password = egress
            .password
            .as_ref()
            .map_or("", |p| p.expose_secret());
        let token = STANDARD.encode(format!("{user}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    request
}

/// Read up to and including the blank line ending the response head
///
/// Reads byte by byte so nothing past the head is consumed.
async fn read_response_head<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::Transport("egress proxy response too large".to_string()));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(Error::Transport(
                "egress proxy closed during tunnel setup".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    String::from_utf8(head).map_err(|_| Error::Transport("egress proxy sent invalid response".to_string()))
}

fn parse_status(head: &str) -> Result<u16> {
    head.lines()
        .next()
        .and_then(|line| {
            let mut parts = line.split_whitespace();
            let version = parts.next()?;
            if !version.starts_with("HTTP/") {
                return None;
            }
            parts.next()?.parse().ok()
        })
        .ok_or_else(|| Error::Transport("egress proxy sent malformed status line".to_string()))
}
