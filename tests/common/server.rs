//! Mock debugger endpoints.
//!
//! `MockHttpServer` answers the discovery routes with canned JSON.
//! `MockCdpServer` accepts one websocket connection, records every
//! inbound frame in arrival order, and answers through a caller-supplied
//! responder; tests can also push unsolicited event frames, the way a
//! real debugger pushes `Fetch.requestPaused`.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// Serves fixed JSON bodies keyed by request path.
pub struct MockHttpServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl MockHttpServer {
    /// Bind an ephemeral port and serve `routes` until dropped.
    pub async fn start(routes: Vec<(&str, Value)>) -> Self {
        let routes: Arc<Vec<(String, Value)>> = Arc::new(
            routes
                .into_iter()
                .map(|(path, body)| (path.to_string(), body))
                .collect(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let routes = Arc::clone(&routes);
                tokio::spawn(serve_http_once(stream, routes));
            }
        });
        Self { addr, handle }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_http_once(mut stream: TcpStream, routes: Arc<Vec<(String, Value)>>) {
    let mut buffer = [0u8; 8192];
    let Ok(read) = stream.read(&mut buffer).await else {
        return;
    };
    let request = String::from_utf8_lossy(&buffer[..read]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let response = match routes.iter().find(|(route, _)| route == path) {
        Some((_, body)) => {
            let payload = body.to_string();
            format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{payload}",
                payload.len()
            )
        }
        None => "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_string(),
    };
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

enum Control {
    Frame(Value),
    Close,
}

/// One-shot websocket peer playing the debugger's side of the protocol.
pub struct MockCdpServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Value>>>,
    control: mpsc::UnboundedSender<Control>,
    handle: JoinHandle<()>,
}

impl MockCdpServer {
    /// Accept one connection; feed every inbound frame to `respond`
    /// and send whatever it returns.
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&received);
        let (control, mut control_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(websocket) = accept_async(stream).await else {
                return;
            };
            let (mut sink, mut source) = websocket.split();
            loop {
                tokio::select! {
                    message = source.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                                continue;
                            };
                            seen.lock().push(frame.clone());
                            for reply in respond(&frame) {
                                if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                        Some(Ok(_)) => {}
                    },
                    command = control_rx.recv() => match command {
                        Some(Control::Frame(frame)) => {
                            if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                                return;
                            }
                        }
                        Some(Control::Close) | None => {
                            let _ = sink.send(Message::Close(None)).await;
                            return;
                        }
                    },
                }
            }
        });

        Self {
            addr,
            received,
            control,
            handle,
        }
    }

    /// Websocket url a client should dial.
    pub fn url(&self) -> String {
        format!("ws://{}/devtools/browser/mock", self.addr)
    }

    /// Everything received so far, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }

    /// Push an unsolicited event frame to the client.
    pub fn push(&self, frame: Value) {
        let _ = self.control.send(Control::Frame(frame));
    }

    /// Send a close frame and stop serving.
    pub fn close(&self) {
        let _ = self.control.send(Control::Close);
    }

    /// Block until at least `count` frames have arrived.
    pub async fn wait_for_frames(&self, count: usize) {
        for _ in 0..500 {
            if self.received.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} frames");
    }

    /// Block until a frame with the given method arrives.
    pub async fn wait_for_method(&self, method: &str) {
        for _ in 0..500 {
            if self
                .received
                .lock()
                .iter()
                .any(|frame| frame.get("method").and_then(Value::as_str) == Some(method))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for a {method} frame");
    }
}

impl Drop for MockCdpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
