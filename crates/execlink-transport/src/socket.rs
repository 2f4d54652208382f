//! Socket seam between the connection manager and the network.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    self, Message, Utf8Bytes,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use url::Url;

use crate::protocol::ABNORMAL_CLOSE_CODE;

/// Close code reported when the peer sent a close frame without a status.
const NO_STATUS_CLOSE_CODE: u16 = 1005;

/// Frame handed to the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    /// Close the socket normally.
    Close,
}

/// Frame or notification read from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    /// The socket is gone. Always the last item.
    Closed { code: u16, reason: String },
}

/// Both directions of an open socket.
#[derive(Debug)]
pub struct SocketHandle {
    pub outgoing: mpsc::UnboundedSender<Outgoing>,
    pub incoming: mpsc::UnboundedReceiver<Incoming>,
}

impl SocketHandle {
    /// Create a handle plus the peer ends, for in-process sockets.
    #[must_use]
    pub fn pair() -> (Self, SocketPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                outgoing: out_tx,
                incoming: in_rx,
            },
            SocketPeer {
                received: out_rx,
                inject: in_tx,
            },
        )
    }
}

/// Far side of an in-process socket.
#[derive(Debug)]
pub struct SocketPeer {
    /// Frames the client wrote.
    pub received: mpsc::UnboundedReceiver<Outgoing>,
    /// Frames delivered to the client.
    pub inject: mpsc::UnboundedSender<Incoming>,
}

/// Why a socket could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The transport cannot be built at all (bad URL, unsupported scheme).
    #[error("Cannot construct transport: {0}")]
    Construction(String),
    /// The engine could not be reached or the handshake failed.
    #[error("Engine unreachable: {0}")]
    Unreachable(String),
}

/// Opens sockets to the engine.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a socket to `url`.
    async fn open(&self, url: &str) -> Result<SocketHandle, ConnectError>;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<SocketHandle, ConnectError> {
        let parsed = Url::parse(url).map_err(|e| ConnectError::Construction(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConnectError::Construction(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(classify)?;
        let (mut sender, mut receiver) = stream.split();

        let (handle, peer) = SocketHandle::pair();
        let SocketPeer {
            received: mut rx,
            inject: tx,
        } = peer;

        // Forward queued frames to the WebSocket
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    Outgoing::Text(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: Utf8Bytes::from_static("client disconnect"),
                        };
                        let _ = sender.send(Message::Close(Some(frame))).await;
                        let _ = sender.close().await;
                        break;
                    }
                }
            }
        });

        // Read frames until the socket closes
        tokio::spawn(async move {
            let (code, reason) = loop {
                match receiver.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if tx.send(Incoming::Text(text.as_str().to_owned())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            if tx.send(Incoming::Text(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(
                            || (NO_STATUS_CLOSE_CODE, String::new()),
                            |f| (u16::from(f.code), f.reason.as_str().to_owned()),
                        );
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error: {e}");
                        break (ABNORMAL_CLOSE_CODE, e.to_string());
                    }
                    None => break (ABNORMAL_CLOSE_CODE, "stream ended".to_string()),
                }
            };
            let _ = tx.send(Incoming::Closed { code, reason });
        });

        Ok(handle)
    }
}

fn classify(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Url(e) => ConnectError::Construction(e.to_string()),
        other => ConnectError::Unreachable(other.to_string()),
    }
}
