//! Transport client for the Hub stream.
//!
//! One WebSocket connection per session attempt, carrying one JSON envelope
//! per text frame. The write half is not safe for concurrent use, so it is
//! owned by a single writer task ([`spawn_writer`]) fed through an
//! [`Outbox`]; all producers submit there and frames reach the wire in
//! submission order. The read half applies transport-level keep-alive: after
//! 30 s without any inbound frame a WebSocket PING goes out, and if nothing
//! arrives within a further 10 s the connection is failed.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use tether_core::constants::{DIAL_TIMEOUT, KEEPALIVE_GRACE, KEEPALIVE_IDLE};
use tether_core::protocol::AgentEnvelope;
use tether_core::{Error, Result};

use crate::cancel::CancelToken;

/// Outbound queue depth before producers are backpressured.
const SEND_QUEUE_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the stream, pre-split.
pub type WsSink = SplitSink<WsStream, Message>;

/// Normalize a configured Hub address into a WebSocket URL.
///
/// Accepts `ws://`/`wss://` as-is, maps `http`/`https` to their WebSocket
/// counterparts, and defaults a bare `host:port` to `ws://`.
pub fn normalize_hub_url(addr: &str) -> String {
    if addr.starts_with("ws://") || addr.starts_with("wss://") {
        addr.to_string()
    } else if let Some(rest) = addr.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = addr.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{addr}")
    }
}

/// Dial the Hub. Each call produces a fresh connection; stale connections
/// are never reused across attempts.
pub async fn connect(addr: &str) -> Result<(WsSink, Receiver)> {
    let url = normalize_hub_url(addr);
    let (ws, _response) = timeout(DIAL_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| Error::transport(format!("连接超时 ({}s)", DIAL_TIMEOUT.as_secs())))?
        .map_err(|e| Error::transport(format!("连接失败: {e}")))?;
    let (sink, stream) = ws.split();
    Ok((sink, Receiver { stream }))
}

/// One write operation for the writer task.
#[derive(Debug)]
pub enum WriteOp {
    /// Protocol envelope, serialized to a text frame.
    Message(AgentEnvelope),
    /// Transport-level keep-alive PING.
    Ping,
}

/// Cloneable producer handle for the single writer task.
///
/// Every upstream message from every handler goes through here, so the
/// wire sees exactly one producer and frames are never interleaved.
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::Sender<WriteOp>,
}

impl Outbox {
    /// Raw channel constructor; the caller owns the consuming end.
    /// Production code uses [`spawn_writer`]; tests consume the receiver
    /// directly to observe the wire order.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<WriteOp>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Submit an envelope for sending. Fails once the session writer is
    /// gone.
    pub async fn send(&self, envelope: AgentEnvelope) -> Result<()> {
        self.tx
            .send(WriteOp::Message(envelope))
            .await
            .map_err(|_| Error::transport("发送通道已关闭"))
    }

    pub(crate) async fn keepalive_ping(&self) -> Result<()> {
        self.tx
            .send(WriteOp::Ping)
            .await
            .map_err(|_| Error::transport("发送通道已关闭"))
    }
}

/// Start the writer task owning the sink. A send failure records a
/// transport cause on `cancel` so the session tears down; the task exits
/// when every [`Outbox`] clone is dropped or after a failure.
pub fn spawn_writer(mut sink: WsSink, cancel: CancelToken) -> Outbox {
    let (outbox, mut rx) = Outbox::channel(SEND_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            let result = match op {
                WriteOp::Message(envelope) => match envelope.encode() {
                    Ok(text) => sink
                        .send(Message::Text(text.into()))
                        .await
                        .map_err(|e| Error::transport(format!("发送消息失败: {e}"))),
                    Err(e) => Err(e),
                },
                WriteOp::Ping => sink
                    .send(Message::Ping(Bytes::new()))
                    .await
                    .map_err(|e| Error::transport(format!("发送 PING 失败: {e}"))),
            };
            if let Err(e) = result {
                warn!("[连接] {e}");
                cancel.cancel_with(e);
                break;
            }
        }
        let _ = sink.close().await;
    });
    outbox
}

/// Read half of the stream with keep-alive applied.
pub struct Receiver {
    stream: SplitStream<WsStream>,
}

impl Receiver {
    /// Receive the next text frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream. Control frames
    /// refresh the idle clock and are otherwise ignored. `outbox` is used
    /// to emit the keep-alive PING when the stream goes idle.
    pub async fn recv(&mut self, outbox: &Outbox) -> Result<Option<String>> {
        loop {
            let frame = match timeout(KEEPALIVE_IDLE, self.stream.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    outbox.keepalive_ping().await?;
                    match timeout(KEEPALIVE_GRACE, self.stream.next()).await {
                        Ok(frame) => frame,
                        Err(_) => {
                            let total = KEEPALIVE_IDLE + KEEPALIVE_GRACE;
                            return Err(Error::transport(format!(
                                "连接空闲超时 ({}s)",
                                total.as_secs()
                            )));
                        }
                    }
                }
            };

            match frame {
                None => return Ok(None),
                Some(Err(e)) => {
                    return Err(Error::transport(format!("接收消息失败: {e}")));
                }
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => continue,
                },
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
            }
        }
    }
}
