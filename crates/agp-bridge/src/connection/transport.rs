//! Transport seam and the WebSocket implementation.
//!
//! A [`TransportLink`] is a pair of channels: frames to write and events read
//! from the socket. Implementations own the socket inside a pump task, so the
//! connection manager never touches it directly.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::ConnectionError;

/// Size of the per-link frame and event buffers.
const LINK_BUFFER_SIZE: usize = 256;

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub url: String,
    pub device_id: String,
    pub account_id: Option<String>,
    pub token: Option<String>,
}

impl ConnectTarget {
    /// URL with the connection parameters appended to the query string.
    pub fn to_url(&self) -> String {
        let mut params = vec![format!("guid={}", urlencoding::encode(&self.device_id))];
        if let Some(ref account_id) = self.account_id {
            params.push(format!("user_id={}", urlencoding::encode(account_id)));
        }
        if let Some(ref token) = self.token {
            params.push(format!("token={}", urlencoding::encode(token)));
        }

        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, separator, params.join("&"))
    }

    /// URL safe to log (token redacted).
    pub fn redacted_url(&self) -> String {
        Self {
            token: self.token.as_ref().map(|_| "***".to_string()),
            ..self.clone()
        }
        .to_url()
    }
}

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Transport-level keepalive.
    Ping,
    Close,
}

/// Inbound transport event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Pong,
    Closed { reason: Option<String> },
    Error(String),
}

/// An open link. Dropping `outbound` closes the link.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Opens links to the peer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<TransportLink, ConnectionError>;
}

// ============================================================================
// WebSocket transport
// ============================================================================

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsTransport {
    buffer: usize,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            buffer: LINK_BUFFER_SIZE,
        }
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, target: &ConnectTarget) -> Result<TransportLink, ConnectionError> {
        debug!("Connecting WebSocket to {}", target.redacted_url());

        let (socket, _response) = connect_async(target.to_url())
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        info!("WebSocket connected to {}", target.url);

        let (outbound_tx, outbound_rx) = mpsc::channel(self.buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.buffer);
        tokio::spawn(pump(socket, outbound_rx, inbound_tx));

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Bridge the socket to the link channels until either side goes away.
async fn pump(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::Receiver<Frame>,
    inbound: mpsc::Sender<TransportEvent>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let message = match frame {
                    Some(Frame::Text(text)) => Message::Text(text.into()),
                    Some(Frame::Ping) => Message::Ping(Default::default()),
                    Some(Frame::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        debug!("WebSocket pump closing on request");
                        break;
                    }
                };
                if let Err(e) = sink.send(message).await {
                    let _ = inbound.send(TransportEvent::Error(e.to_string())).await;
                    break;
                }
            }

            msg = stream.next() => {
                let event = match msg {
                    Some(Ok(Message::Text(text))) => TransportEvent::Message(text.to_string()),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => TransportEvent::Message(text),
                        Err(_) => {
                            warn!("Dropping non-UTF-8 binary frame ({} bytes)", data.len());
                            continue;
                        }
                    },
                    Some(Ok(Message::Pong(_))) => TransportEvent::Pong,
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite queues the pong itself
                        continue;
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.as_str().to_string());
                        let _ = inbound.send(TransportEvent::Closed { reason }).await;
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = inbound.send(TransportEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = inbound.send(TransportEvent::Closed { reason: None }).await;
                        break;
                    }
                };
                if inbound.send(event).await.is_err() {
                    debug!("Link receiver dropped, closing WebSocket");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    debug!("WebSocket pump task ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_parameters_are_encoded() {
        let target = ConnectTarget {
            url: "wss://agp.example.com/ws".into(),
            device_id: "dev 1".into(),
            account_id: Some("acct&2".into()),
            token: Some("t=k".into()),
        };
        assert_eq!(
            target.to_url(),
            "wss://agp.example.com/ws?guid=dev%201&user_id=acct%262&token=t%3Dk"
        );
    }

    #[test]
    fn test_url_appends_to_existing_query() {
        let target = ConnectTarget {
            url: "ws://localhost:9000/ws?v=2".into(),
            device_id: "d".into(),
            account_id: None,
            token: None,
        };
        assert_eq!(target.to_url(), "ws://localhost:9000/ws?v=2&guid=d");
    }

    #[test]
    fn test_redacted_url_hides_token() {
        let target = ConnectTarget {
            url: "ws://localhost/ws".into(),
            device_id: "d".into(),
            account_id: None,
            token: Some("secret".into()),
        };
        let redacted = target.redacted_url();
        assert!(!redacted.contains("secret"));
        assert!(redacted.contains("token=%2A%2A%2A"));
    }
}
