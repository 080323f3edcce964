//! Socket backend abstraction (spec.md §4.7, §9 "dynamic dispatch for socket backends").
//!
//! The original implementation picked between two incompatible WebSocket libraries at runtime
//! by probing for a `send_bytes` attribute. Rust has no equivalent dynamic-attribute dispatch, so
//! this is re-expressed as a capability trait the engine is generic over. The one production
//! implementor wraps `fastwebsockets` (the same crate the teacher crate uses for its transport
//! layer); a loopback pair is provided for tests.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use fastwebsockets::{Frame, OpCode, Payload, WebSocketRead, WebSocketWrite};
use http_body_util::Empty;
use hyper::header::{CONNECTION, HOST, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::io;
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use url::Url;

/// What the engine needs from a live WebSocket: send a binary frame, receive the next one
/// (`None` means the peer closed cleanly), and close.
#[async_trait]
pub trait WsTransport: Send {
    async fn send_bytes(&mut self, data: Bytes) -> io::Result<()>;
    async fn recv_bytes(&mut self) -> io::Result<Option<Bytes>>;
    async fn close(&mut self) -> io::Result<()>;
}

/// Production transport: a WebSocket established (client or server side) over `fastwebsockets`.
pub struct FastWsTransport {
    rx: WebSocketRead<ReadHalf<TokioIo<Upgraded>>>,
    tx: Arc<Mutex<WebSocketWrite<WriteHalf<TokioIo<Upgraded>>>>>,
}

impl FastWsTransport {
    pub fn from_upgraded(ws: fastwebsockets::WebSocket<TokioIo<Upgraded>>) -> Self {
        let (rx, tx) = ws.split(tokio::io::split);
        Self {
            rx,
            tx: Arc::new(Mutex::new(tx)),
        }
    }
}

#[async_trait]
impl WsTransport for FastWsTransport {
    async fn send_bytes(&mut self, data: Bytes) -> io::Result<()> {
        self.tx
            .lock()
            .await
            .write_frame(Frame::binary(Payload::Owned(data.to_vec())))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e))
    }

    async fn recv_bytes(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            let tx = self.tx.clone();
            let frame = self
                .rx
                .read_frame(&mut move |f| {
                    let tx = tx.clone();
                    async move { tx.lock().await.write_frame(f).await }
                })
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::ConnectionAborted, e))?;
            match frame.opcode {
                OpCode::Binary | OpCode::Text | OpCode::Continuation => {
                    return Ok(Some(Bytes::copy_from_slice(frame.payload.as_ref())));
                }
                OpCode::Close => return Ok(None),
                // Ping/Pong are answered by the control callback passed to read_frame above.
                OpCode::Ping | OpCode::Pong => continue,
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.tx
            .lock()
            .await
            .write_frame(Frame::close(1000, &[]))
            .await
            .map(|_| ())
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }
}

/// Dial a `ws://host:port/path` URL as a client and complete the WebSocket handshake.
///
/// Only plaintext `ws://` is supported: message-level encryption is a non-goal of this engine
/// (spec.md §1) and is assumed handled by a TLS layer in front of it (a reverse proxy, or a
/// `wss://`-terminating component outside this crate), not reimplemented here.
pub async fn dial(url_str: &str) -> anyhow::Result<FastWsTransport> {
    let url = Url::parse(url_str).with_context(|| format!("invalid websocket url {url_str:?}"))?;
    anyhow::ensure!(
        url.scheme() == "ws",
        "only ws:// urls are supported here; wss:// must be terminated by an external TLS layer"
    );
    let host = url.host_str().ok_or_else(|| anyhow!("url {url_str:?} has no host"))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let path = if url.path().is_empty() { "/" } else { url.path() };

    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("failed to connect to {host}:{port}"))?;

    let req = Request::builder()
        .method("GET")
        .uri(path)
        .header(HOST, host)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header(SEC_WEBSOCKET_KEY, fastwebsockets::handshake::generate_key())
        .header(SEC_WEBSOCKET_VERSION, "13")
        .body(Empty::<Bytes>::new())?;

    let (mut ws, _response) = fastwebsockets::handshake::client(&TokioExecutor::new(), req, stream)
        .await
        .map_err(|e| anyhow!("websocket handshake with {url_str:?} failed: {e}"))?;
    ws.set_auto_apply_mask(true); // client-to-server frames must be masked

    Ok(FastWsTransport::from_upgraded(ws))
}

/// In-process duplex pair used by tests in place of a real socket, grounded in the capability
/// abstraction the original's two-library dispatch motivated (spec.md §9).
pub struct LoopbackTransport {
    tx: tokio::sync::mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::mpsc::UnboundedReceiver<Bytes>,
    closed: bool,
}

impl LoopbackTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, rx_b) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                tx: tx_a,
                rx: rx_b,
                closed: false,
            },
            Self {
                tx: tx_b,
                rx: rx_a,
                closed: false,
            },
        )
    }
}

#[async_trait]
impl WsTransport for LoopbackTransport {
    async fn send_bytes(&mut self, data: Bytes) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "loopback closed"));
        }
        self.tx
            .send(data)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"))
    }

    async fn recv_bytes(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}
