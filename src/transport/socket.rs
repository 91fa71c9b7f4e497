//! Websocket client for a single debugger connection.
//!
//! One writer task owns the sink; every producer posts through a
//! [`SocketHandle`], so outbound frames are serialized without holding
//! a lock across the wire. The read loop parses each text frame as JSON
//! and hands it to the [`FrameHandler`] in arrival order. Malformed
//! frames are dropped and logged, never fatal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Minimum gap between two protocol-error log lines on one connection.
const PROTOCOL_ERROR_WINDOW: Duration = Duration::from_secs(5);

/// Callbacks a connection owner implements to consume the frame stream.
///
/// `on_frame` is invoked sequentially from the read loop, so a slow
/// handler stalls the stream. Handlers hand long work to tasks.
#[async_trait::async_trait]
pub trait FrameHandler: Send + Sync {
    /// Runs once, after the handshake and before the first frame.
    async fn on_open(&self, socket: &SocketHandle);

    /// Runs for every well-formed JSON text frame, in arrival order.
    async fn on_frame(&self, socket: &SocketHandle, frame: Value);

    /// Runs when the connection is gone, before [`connect`] returns.
    async fn on_close(&self);
}

enum Outbound {
    Frame(String),
    Close(String),
}

/// Cheap, cloneable sender half of a connection.
///
/// A handle outliving its connection is harmless; posting on it then
/// yields a transport error instead of a panic.
#[derive(Clone)]
pub struct SocketHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SocketHandle {
    /// Queue one JSON command for transmission.
    ///
    /// # Errors
    /// Fails when the connection has already shut down.
    pub fn post(&self, command: &Value) -> Result<()> {
        self.tx
            .send(Outbound::Frame(command.to_string()))
            .map_err(|_| Error::transport("socket writer is gone"))
    }

    /// Queue a command addressed to an attached session.
    ///
    /// # Errors
    /// Fails when the connection has already shut down.
    pub fn post_to_session(&self, command: &Value, session_id: &str) -> Result<()> {
        let mut framed = command.clone();
        if let Some(map) = framed.as_object_mut() {
            map.insert("sessionId".into(), Value::String(session_id.to_string()));
        }
        self.post(&framed)
    }

    /// Ask the writer to send a close frame and stop.
    ///
    /// # Errors
    /// Fails when the connection has already shut down.
    pub fn close(&self, reason: &str) -> Result<()> {
        self.tx
            .send(Outbound::Close(reason.to_string()))
            .map_err(|_| Error::transport("socket writer is gone"))
    }
}

/// Connect to `url` and pump frames into `handler` until the socket
/// drops. Returns `Ok` after a clean close, `Err` on a transport fault;
/// either way `on_close` has fired by the time this returns. The caller
/// owns any reconnect policy.
///
/// # Errors
/// Fails when the handshake is refused or the stream breaks mid-read.
pub async fn connect(url: &str, common_name: &str, handler: Arc<dyn FrameHandler>) -> Result<()> {
    let (stream, _) = connect_async(url).await?;
    info!(socket = common_name, "connected");

    let (mut sink, mut source) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let handle = SocketHandle { tx };

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    handler.on_open(&handle).await;

    let mut throttle = ErrorThrottle::new(PROTOCOL_ERROR_WINDOW);
    let outcome = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(text.as_str()) {
                Ok(frame) => handler.on_frame(&handle, frame).await,
                Err(err) => {
                    if throttle.admit() {
                        warn!(socket = common_name, error = %err, "dropping malformed frame");
                    }
                }
            },
            Some(Ok(Message::Close(_))) => {
                debug!(socket = common_name, "peer closed");
                break Ok(());
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => break Err(Error::from(err)),
            None => break Ok(()),
        }
    };

    handler.on_close().await;
    writer.abort();
    outcome
}

/// Lets through at most one event per window.
struct ErrorThrottle {
    window: Duration,
    last: Option<Instant>,
}

impl ErrorThrottle {
    const fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    fn admit(&mut self) -> bool {
        let now = Instant::now();
        let due = self
            .last
            .is_none_or(|last| now.duration_since(last) >= self.window);
        if due {
            self.last = Some(now);
        }
        due
    }
}
