//! Bidirectional text-frame socket.
//!
//! A [`Socket`] is a pair of bounded frame channels plus a disconnection flag.
//! The WebSocket backend pumps a `tokio-tungstenite` stream into those
//! channels; [`Socket::pair`] links one directly to an in-process
//! [`SocketPeer`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use babylink_common::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct SocketParts {
    pub id: u64,
    pub incoming: mpsc::Receiver<String>,
    pub outgoing: mpsc::Sender<String>,
    pub closed: Arc<watch::Sender<bool>>,
    pub io_tasks: Vec<JoinHandle<()>>,
}

/// An open text socket. Consumed by exactly one [`Conductor`](crate::Conductor).
pub struct Socket {
    parts: SocketParts,
}

impl Socket {
    /// Opens a WebSocket client connection.
    pub async fn connect(url: &Url, capacity: usize) -> Result<Self> {
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::transport(format!("connect {url}: {e}")))?;
        info!(%url, "signaling socket connected");
        Ok(Self::from_websocket(ws, capacity))
    }

    /// Wraps an established WebSocket, client or server side.
    pub fn from_websocket<S>(ws: WebSocketStream<S>, capacity: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
        let (mut sink, mut stream) = ws.split();
        let (incoming_tx, incoming) = mpsc::channel::<String>(capacity);
        let (outgoing, mut outgoing_rx) = mpsc::channel::<String>(capacity);
        let closed = Arc::new(watch::channel(false).0);

        let reader = {
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => {
                            if incoming_tx.send(text.to_string()).await.is_err() {
                                break;
                            }
                        }
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(socket = id, error = %e, "socket read failed");
                            break;
                        }
                    }
                }
                debug!(socket = id, "socket reader finished");
                closed.send_replace(true);
            })
        };

        let writer = {
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                while let Some(text) = outgoing_rx.recv().await {
                    if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                        warn!(socket = id, error = %e, "socket write failed");
                        break;
                    }
                }
                let _ = sink.close().await;
                closed.send_replace(true);
            })
        };

        Self {
            parts: SocketParts {
                id,
                incoming,
                outgoing,
                closed,
                io_tasks: vec![reader, writer],
            },
        }
    }

    /// Creates a socket linked to an in-process peer.
    pub fn pair(capacity: usize) -> (Socket, SocketPeer) {
        let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
        let (to_socket, incoming) = mpsc::channel(capacity);
        let (outgoing, from_socket) = mpsc::channel(capacity);
        let closed = Arc::new(watch::channel(false).0);

        let socket = Socket {
            parts: SocketParts {
                id,
                incoming,
                outgoing,
                closed: Arc::clone(&closed),
                io_tasks: Vec::new(),
            },
        };
        let peer = SocketPeer {
            to_socket: Some(to_socket),
            from_socket,
            closed,
        };
        (socket, peer)
    }

    pub fn id(&self) -> u64 {
        self.parts.id
    }

    /// Flips to `true` once the connection is lost.
    pub fn disconnected(&self) -> watch::Receiver<bool> {
        self.parts.closed.subscribe()
    }

    pub(crate) fn into_parts(self) -> SocketParts {
        self.parts
    }
}

/// The far end of a [`Socket::pair`].
pub struct SocketPeer {
    to_socket: Option<mpsc::Sender<String>>,
    from_socket: mpsc::Receiver<String>,
    closed: Arc<watch::Sender<bool>>,
}

impl SocketPeer {
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        let tx = self
            .to_socket
            .as_ref()
            .ok_or_else(|| Error::closed("socket peer disconnected"))?;
        tx.send(text.into())
            .await
            .map_err(|_| Error::closed("socket dropped"))
    }

    /// Next frame written by the socket side, `None` once it is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_socket.recv().await
    }

    pub fn disconnect(&mut self) {
        self.to_socket.take();
        self.closed.send_replace(true);
    }
}

impl Drop for SocketPeer {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Builds sockets from a URL.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Socket>;
}

/// Connects real WebSocket clients.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    capacity: usize,
}

impl WebSocketConnector {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Socket> {
        Socket::connect(url, self.capacity).await
    }
}
