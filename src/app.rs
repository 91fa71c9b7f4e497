//! Application assembly.
//!
//! Everything is constructed here, once, and handed down as `Arc`s:
//! the settings store, the hook registry, the rpc registry with the
//! built-in functions, the plugin manager, and the two long-lived
//! debugger connections. Modules below this one never reach for
//! globals.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::config::ConfigStore;
use crate::encoding;
use crate::error::{Error, Result};
use crate::hooks::assets;
use crate::hooks::engine::InterceptEngine;
use crate::hooks::patcher::DocumentPatcher;
use crate::hooks::registry::{HookKind, HookRegistry};
use crate::ipc::{self, IpcDispatcher, RpcRegistry, RpcRegistryBuilder};
use crate::plugins::{BackendLoader, NullBackendLoader, PluginManager};
use crate::transport::{self, Discovery, FrameHandler, SocketHandle, SHARED_JS_CONTEXT};

/// Where a plugin's compiled frontend bundle lives, relative to its
/// directory.
const FRONTEND_BUNDLE: &str = ".millennium/Dist/index.js";

/// Ids for the shared-context shim sequence.
const PAGE_ENABLE_ID: i64 = 0;
const PAGE_SCRIPT_ID: i64 = 1;
const PAGE_RELOAD_ID: i64 = 2;
const PAGE_REMOVE_SCRIPT_ID: i64 = 3;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Launch parameters, already parsed and defaulted by the binary.
#[derive(Debug, Clone)]
pub struct MillenniumOptions {
    /// Port Steam's remote debugger listens on.
    pub devtools_port: u16,
    /// Settings file location.
    pub config_path: PathBuf,
    /// Directory scanned for plugin subdirectories.
    pub plugins_dir: PathBuf,
    /// IPC listener port; `0` picks an ephemeral one.
    pub ipc_port: u16,
}

/// Run the whole stack until interrupted.
///
/// # Errors
/// Fails on startup problems only: a port that cannot be bound or a
/// settings path that cannot be prepared. Anything after bootstrap is
/// retried, not returned.
pub async fn run(options: MillenniumOptions) -> Result<()> {
    let started = Instant::now();

    let store = Arc::new(ConfigStore::new(
        options.config_path,
        crate::config::default_settings(),
    ));
    store.load();

    let registry = Arc::new(HookRegistry::new());

    let listener = ipc::bind(options.ipc_port).await?;
    let ipc_port = listener.local_addr()?.port();

    let loader: Arc<dyn BackendLoader> = Arc::new(NullBackendLoader);
    let manager = Arc::new(PluginManager::new(
        Arc::clone(&store),
        loader,
        options.plugins_dir,
    ));

    let shared = Arc::new(SharedFrontend::new(
        ipc_port,
        Arc::clone(&manager),
        started,
    ));

    let rpc = build_rpc_registry(&store, &registry, &manager, &shared);
    let dispatcher = Arc::new(IpcDispatcher::new(rpc).on_frontend_loaded({
        let shared = Arc::clone(&shared);
        let manager = Arc::clone(&manager);
        move |plugin| {
            shared.mark_loaded(plugin);
            let _ = manager.frontend_loaded(plugin);
        }
    }));
    tokio::spawn(ipc::serve(listener, dispatcher));

    manager.report();
    for (name, done) in manager.start_enabled() {
        match done.await {
            Ok(Ok(())) => info!(plugin = %name, "backend ready"),
            Ok(Err(err)) => {
                error!(plugin = %name, error = %err, "backend failed, continuing without it");
            }
            Err(_) => error!(plugin = %name, "backend worker dropped the ack"),
        }
    }

    let engine_handler = Arc::new(EngineHandler {
        engine: Mutex::new(InterceptEngine::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            DocumentPatcher::new(ipc_port),
        )),
    });
    {
        let handler = Arc::clone(&engine_handler);
        tokio::spawn(async move {
            let mut tick = interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                handler.engine.lock().sweep_expired();
            }
        });
    }

    let discovery = Discovery::new(options.devtools_port)?;
    let browser = tokio::spawn(browser_loop(discovery.clone(), Arc::clone(&engine_handler)));
    let shared_loop = tokio::spawn(shared_context_loop(discovery, Arc::clone(&shared)));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    browser.abort();
    shared_loop.abort();
    Ok(())
}

/// Keep the browser-wide interception connection alive forever.
async fn browser_loop(discovery: Discovery, handler: Arc<EngineHandler>) {
    loop {
        let url = discovery.browser_endpoint_until_available().await;
        match transport::connect(&url, "browser", Arc::clone(&handler) as Arc<dyn FrameHandler>)
            .await
        {
            Ok(()) => warn!("browser tunnel closed, reconnecting"),
            Err(err) => warn!(error = %err, "browser tunnel collapsed, reconnecting"),
        }
        sleep(RECONNECT_DELAY).await;
    }
}

/// Keep the shared-context connection alive forever.
async fn shared_context_loop(discovery: Discovery, shared: Arc<SharedFrontend>) {
    loop {
        let url = discovery.discover_until_available(SHARED_JS_CONTEXT).await;
        match transport::connect(
            &url,
            SHARED_JS_CONTEXT,
            Arc::clone(&shared) as Arc<dyn FrameHandler>,
        )
        .await
        {
            Ok(()) => warn!("shared context tunnel closed, reconnecting"),
            Err(err) => warn!(error = %err, "shared context tunnel collapsed, reconnecting"),
        }
        sleep(RECONNECT_DELAY).await;
    }
}

/// Glue between the frame stream and the intercept engine. Dispatch
/// happens under the lock, posting happens after it is released.
struct EngineHandler {
    engine: Mutex<InterceptEngine>,
}

#[async_trait::async_trait]
impl FrameHandler for EngineHandler {
    async fn on_open(&self, socket: &SocketHandle) {
        for command in self.engine.lock().setup_commands() {
            if let Err(err) = socket.post(&command) {
                warn!(error = %err, "dropped setup command");
            }
        }
    }

    async fn on_frame(&self, socket: &SocketHandle, frame: Value) {
        let commands = { self.engine.lock().dispatch(&frame) };
        for command in commands {
            if let Err(err) = socket.post(&command) {
                warn!(error = %err, "dropped outbound command");
                break;
            }
        }
    }

    async fn on_close(&self) {
        self.engine.lock().purge();
    }
}

/// Owns the shared-context side: evaluates the loader in the client's
/// JS VM, remembers the installed script so it can be swapped out, and
/// re-injects after the enabled plugin set changes.
pub struct SharedFrontend {
    patcher: DocumentPatcher,
    manager: Arc<PluginManager>,
    handle: Mutex<Option<SocketHandle>>,
    script_id: Mutex<Option<String>>,
    started: Instant,
}

impl SharedFrontend {
    #[must_use]
    pub fn new(ipc_port: u16, manager: Arc<PluginManager>, started: Instant) -> Self {
        Self {
            patcher: DocumentPatcher::new(ipc_port),
            manager,
            handle: Mutex::new(None),
            script_id: Mutex::new(None),
            started,
        }
    }

    /// Frontend bundles of every enabled plugin, as asset-host urls.
    fn module_urls(&self) -> Vec<String> {
        self.manager
            .scan()
            .into_iter()
            .filter(|record| record.enabled)
            .map(|record| {
                let bundle = record.directory.join(FRONTEND_BUNDLE);
                encoding::url_from_path(assets::JAVASCRIPT_HOST, &bundle.to_string_lossy())
            })
            .collect()
    }

    fn inject(&self, socket: &SocketHandle) {
        let source = self.patcher.loader_source(&self.module_urls());
        let sequence = [
            json!({ "id": PAGE_ENABLE_ID, "method": "Page.enable" }),
            json!({
                "id": PAGE_SCRIPT_ID,
                "method": "Page.addScriptToEvaluateOnNewDocument",
                "params": { "source": source },
            }),
            json!({ "id": PAGE_RELOAD_ID, "method": "Page.reload" }),
        ];
        for command in sequence {
            if let Err(err) = socket.post(&command) {
                warn!(error = %err, "shim injection interrupted");
                return;
            }
        }
    }

    /// Tear out the installed loader and evaluate a fresh one built
    /// from the current enabled set.
    pub fn reinject(&self) {
        let Some(socket) = self.handle.lock().clone() else {
            debug!("shared context not connected, reinjection deferred to next connect");
            return;
        };
        if let Some(identifier) = self.script_id.lock().take() {
            let removal = json!({
                "id": PAGE_REMOVE_SCRIPT_ID,
                "method": "Page.removeScriptToEvaluateOnNewDocument",
                "params": { "identifier": identifier },
            });
            if let Err(err) = socket.post(&removal) {
                warn!(error = %err, "stale loader removal failed");
            }
        }
        self.inject(&socket);
    }

    /// Called when a plugin's frontend announces it finished loading.
    pub fn mark_loaded(&self, plugin: &str) {
        info!(plugin, elapsed = ?self.started.elapsed(), "frontend loaded");
    }
}

#[async_trait::async_trait]
impl FrameHandler for SharedFrontend {
    async fn on_open(&self, socket: &SocketHandle) {
        *self.handle.lock() = Some(socket.clone());
        self.inject(socket);
    }

    async fn on_frame(&self, _socket: &SocketHandle, frame: Value) {
        if frame.get("id").and_then(Value::as_i64) == Some(PAGE_SCRIPT_ID) {
            if let Some(identifier) = frame.pointer("/result/identifier").and_then(Value::as_str) {
                *self.script_id.lock() = Some(identifier.to_string());
            }
        }
    }

    async fn on_close(&self) {
        *self.handle.lock() = None;
        *self.script_id.lock() = None;
    }
}

/// Assemble the rpc registry with the core built-ins.
pub fn build_rpc_registry(
    store: &Arc<ConfigStore>,
    registry: &Arc<HookRegistry>,
    manager: &Arc<PluginManager>,
    shared: &Arc<SharedFrontend>,
) -> Arc<RpcRegistry> {
    let mut builder = RpcRegistryBuilder::new();

    builder = builder.register_call("core.find_all_plugins", {
        let manager = Arc::clone(manager);
        move |_| {
            let records: Vec<Value> = manager
                .scan()
                .into_iter()
                .map(|record| {
                    json!({
                        "name": record.name,
                        "commonName": record.common_name,
                        "enabled": record.enabled,
                        "useBackend": record.use_backend,
                        "path": record.directory.to_string_lossy(),
                        "manifest": record.manifest,
                    })
                })
                .collect();
            Ok(json!(records))
        }
    });

    builder = builder.register_call("core.toggle_plugin_status", {
        let manager = Arc::clone(manager);
        let shared = Arc::clone(shared);
        move |args| {
            let name = args
                .get("pluginName")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::protocol("toggle_plugin_status needs a pluginName"))?;
            let enabled = args
                .get("enabled")
                .and_then(Value::as_bool)
                .ok_or_else(|| Error::protocol("toggle_plugin_status needs an enabled flag"))?;
            let done = manager.toggle(name, enabled)?;
            let shared = Arc::clone(&shared);
            let plugin = name.to_string();
            tokio::spawn(async move {
                match done.await {
                    Ok(Ok(())) => shared.reinject(),
                    Ok(Err(err)) => {
                        error!(plugin = %plugin, error = %err, "lifecycle change failed")
                    }
                    Err(_) => error!(plugin = %plugin, "lifecycle worker dropped the ack"),
                }
            });
            Ok(json!(true))
        }
    });

    builder = builder.register_call("core.get_config", {
        let store = Arc::clone(store);
        move |args| {
            let path = args
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::protocol("get_config needs a path"))?;
            let fallback = args.get("default").cloned().unwrap_or(Value::Null);
            Ok(store.get(path, fallback))
        }
    });

    builder = builder.register_call("core.set_config", {
        let store = Arc::clone(store);
        move |args| {
            let path = args
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::protocol("set_config needs a path"))?;
            let value = args
                .get("value")
                .cloned()
                .ok_or_else(|| Error::protocol("set_config needs a value"))?;
            let silent = args
                .get("skipPropagation")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if silent {
                store.set_silent(path, value);
            } else {
                store.set(path, value);
            }
            Ok(json!(true))
        }
    });

    builder = builder.register_call("core.add_browser_css", {
        let registry = Arc::clone(registry);
        move |args| add_hook(&registry, &args, HookKind::Stylesheet)
    });

    builder = builder.register_call("core.add_browser_js", {
        let registry = Arc::clone(registry);
        move |args| add_hook(&registry, &args, HookKind::Javascript)
    });

    builder = builder.register_call("core.remove_browser_module", {
        let registry = Arc::clone(registry);
        move |args| {
            let id = args
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::protocol("remove_browser_module needs an id"))?;
            Ok(json!(registry.remove(id)))
        }
    });

    builder.build()
}

fn add_hook(registry: &HookRegistry, args: &Value, kind: HookKind) -> Result<Value> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol("hook registration needs a path"))?;
    let pattern = args
        .get("urlPattern")
        .and_then(Value::as_str)
        .unwrap_or(".*");
    let id = registry.add(path, pattern, kind)?;
    Ok(json!(id))
}
