//! IPC dispatch.
//!
//! The browser-side shims talk to the core over a local websocket. Each
//! text frame is an envelope: `id` selects the envelope kind, `data`
//! names a function in the [`RpcRegistry`] plus its arguments, and the
//! reply echoes the caller's `iteration` token so concurrent calls can
//! be told apart on the other side.
//!
//! The registry is write-once: it is assembled by a builder during
//! startup and then frozen behind an `Arc`, so dispatch never takes a
//! lock and registration races cannot exist.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Only meaningful inside the plugin-side settings runtime; calls
/// arriving here are a wiring mistake on the caller's part.
pub const RESERVED_SETTINGS_PARSER: &str = "__builtins__.__millennium_plugin_settings_parser__";

/// Envelope kind: invoke a registered function and reply.
pub const CALL_SERVER_METHOD: i64 = 0;
/// Envelope kind: the frontend finished loading; reply with an ack.
pub const FRONT_END_LOADED: i64 = 1;

pub type CallFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;
pub type NotifyFn = Arc<dyn Fn(Value) + Send + Sync>;

/// The two shapes a registered function may have. The closed set is
/// deliberate: a handler that wants anything else composes these.
#[derive(Clone)]
pub enum RpcHandler {
    /// Request/response: takes arguments, returns a JSON value.
    Call(CallFn),
    /// Fire-and-forget: takes arguments, returns nothing.
    Notify(NotifyFn),
}

/// Accumulates handlers before the registry freezes.
#[derive(Default)]
pub struct RpcRegistryBuilder {
    handlers: HashMap<String, RpcHandler>,
}

impl RpcRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, name: &str, handler: RpcHandler) -> Self {
        if self.handlers.insert(name.to_string(), handler).is_some() {
            warn!(function = name, "rpc function re-registered, keeping the newer handler");
        }
        self
    }

    #[must_use]
    pub fn register_call<F>(self, name: &str, call: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, RpcHandler::Call(Arc::new(call)))
    }

    #[must_use]
    pub fn register_notify<F>(self, name: &str, notify: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.register(name, RpcHandler::Notify(Arc::new(notify)))
    }

    /// Freeze the handler set.
    #[must_use]
    pub fn build(self) -> Arc<RpcRegistry> {
        Arc::new(RpcRegistry {
            handlers: self.handlers,
        })
    }
}

/// Immutable name-to-handler map.
pub struct RpcRegistry {
    handlers: HashMap<String, RpcHandler>,
}

impl RpcRegistry {
    /// Invoke `function_name` as a call.
    ///
    /// # Errors
    /// [`Error::NotFound`] for unknown names, [`Error::TypeMismatch`]
    /// when the name resolves to a notify handler, [`Error::Plugin`]
    /// for the reserved settings-parser name, or whatever the handler
    /// itself fails with.
    pub fn dispatch(&self, function_name: &str, args: Value) -> Result<Value> {
        if function_name == RESERVED_SETTINGS_PARSER {
            return Err(Error::plugin("Not applicable to this plugin"));
        }
        match self.handlers.get(function_name) {
            None => Err(Error::not_found(format!(
                "Function not found: {function_name}"
            ))),
            Some(RpcHandler::Call(call)) => call(args),
            Some(RpcHandler::Notify(_)) => Err(Error::type_mismatch(function_name)),
        }
    }

    /// Invoke `function_name` as a notification.
    ///
    /// # Errors
    /// Same taxonomy as [`dispatch`](Self::dispatch), with the shapes
    /// swapped.
    pub fn notify(&self, function_name: &str, args: Value) -> Result<()> {
        if function_name == RESERVED_SETTINGS_PARSER {
            return Err(Error::plugin("Not applicable to this plugin"));
        }
        match self.handlers.get(function_name) {
            None => Err(Error::not_found(format!(
                "Function not found: {function_name}"
            ))),
            Some(RpcHandler::Notify(notify)) => {
                notify(args);
                Ok(())
            }
            Some(RpcHandler::Call(_)) => Err(Error::type_mismatch(function_name)),
        }
    }

    #[must_use]
    pub fn contains(&self, function_name: &str) -> bool {
        self.handlers.contains_key(function_name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Turns raw envelopes into registry calls and reply frames.
pub struct IpcDispatcher {
    registry: Arc<RpcRegistry>,
    frontend_loaded: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl IpcDispatcher {
    #[must_use]
    pub fn new(registry: Arc<RpcRegistry>) -> Self {
        Self {
            registry,
            frontend_loaded: None,
        }
    }

    /// Also run `callback` whenever a front-end-loaded envelope lands.
    /// It receives the announcing plugin's name, empty when the
    /// envelope does not carry one.
    #[must_use]
    pub fn on_frontend_loaded(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.frontend_loaded = Some(Arc::new(callback));
        self
    }

    /// Process one envelope. `None` means no reply is owed.
    #[must_use]
    pub fn process_envelope(&self, envelope: &Value) -> Option<Value> {
        let iteration = envelope.get("iteration").cloned().unwrap_or(Value::Null);
        match envelope.get("id").and_then(Value::as_i64) {
            Some(CALL_SERVER_METHOD) => Some(self.call_server_method(envelope, iteration)),
            Some(FRONT_END_LOADED) => {
                let plugin = envelope
                    .pointer("/data/pluginName")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                debug!(plugin, "frontend reported loaded");
                if let Some(callback) = &self.frontend_loaded {
                    callback(plugin);
                }
                Some(json!({ "id": iteration, "success": true }))
            }
            other => {
                warn!(id = ?other, "unknown ipc envelope kind");
                None
            }
        }
    }

    fn call_server_method(&self, envelope: &Value, iteration: Value) -> Value {
        let data = &envelope["data"];
        let plugin = data.get("pluginName").and_then(Value::as_str).unwrap_or_default();
        let method = data.get("methodName").and_then(Value::as_str).unwrap_or_default();
        let args = data
            .get("argumentList")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let function_name = if plugin.is_empty() {
            method.to_string()
        } else {
            format!("{plugin}.{method}")
        };

        match self.registry.dispatch(&function_name, args) {
            Ok(value) => json!({ "id": iteration, "success": true, "returnValue": value }),
            Err(err) => {
                debug!(function = function_name, error = %err, "ipc call failed");
                json!({ "id": iteration, "success": false, "failMessage": err.to_string() })
            }
        }
    }
}

/// Bind the IPC listener on loopback. Port `0` picks an ephemeral one;
/// the chosen port is what the loader script gets told about.
///
/// # Errors
/// Fails when the address is unavailable.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    Ok(listener)
}

/// Accept IPC clients forever. Each client gets its own task; envelope
/// replies go back on the same connection that carried the request.
///
/// # Errors
/// Fails only when the listener itself breaks.
pub async fn serve(listener: TcpListener, dispatcher: Arc<IpcDispatcher>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "ipc listener up");
    }
    loop {
        let (stream, peer) = listener.accept().await?;
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, dispatcher).await {
                debug!(%peer, error = %err, "ipc client closed with error");
            }
        });
    }
}

async fn handle_client(stream: TcpStream, dispatcher: Arc<IpcDispatcher>) -> Result<()> {
    let websocket = accept_async(stream).await?;
    let (mut sink, mut source) = websocket.split();
    while let Some(message) = source.next().await {
        match message? {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<Value>(text.as_str()) {
                    Ok(envelope) => dispatcher.process_envelope(&envelope),
                    Err(err) => {
                        warn!(error = %err, "undecodable ipc envelope");
                        None
                    }
                };
                if let Some(reply) = reply {
                    sink.send(Message::Text(reply.to_string().into())).await?;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
