//! Plugin discovery and backend lifecycle.
//!
//! A plugin is a directory with a `plugin.json` manifest. Discovery is
//! a glob over the plugins root; nothing is cached, the filesystem is
//! the source of truth. Whether a plugin is enabled lives in the
//! settings store under `plugins.enabledPlugins`.
//!
//! Backend starts and stops run on a small worker pool. Every queued
//! job carries an ack channel, so callers that care can await the
//! outcome and callers that do not can drop the receiver; either way a
//! wedged backend can only ever stall its own worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::ConfigStore;
use crate::error::{Error, Result};

pub const MANIFEST_FILE: &str = "plugin.json";
const ENABLED_PLUGINS_KEY: &str = "plugins.enabledPlugins";
const DEFAULT_WORKERS: usize = 4;

/// Parsed `plugin.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Plugins without a backend are frontend-only bundles.
    #[serde(default = "default_use_backend", rename = "useBackend")]
    pub use_backend: bool,
}

const fn default_use_backend() -> bool {
    true
}

/// One discovered plugin.
#[derive(Debug, Clone)]
pub struct PluginRecord {
    pub name: String,
    pub common_name: String,
    pub enabled: bool,
    pub use_backend: bool,
    /// The raw manifest, handed through to frontends untouched.
    pub manifest: Value,
    pub directory: PathBuf,
}

/// Starts and stops plugin backends. The execution environment behind
/// a backend is the implementor's business; the manager only sequences
/// calls and reports outcomes.
#[async_trait]
pub trait BackendLoader: Send + Sync {
    async fn start(&self, plugin: &PluginRecord) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;

    /// The plugin's frontend bundle finished loading in the client.
    async fn frontend_loaded(&self, name: &str) -> Result<()> {
        debug!(plugin = name, "backend takes no interest in frontend load");
        Ok(())
    }
}

/// Loader that runs nothing. Keeps frontend-only deployments honest:
/// lifecycle bookkeeping still happens, no process ever spawns.
pub struct NullBackendLoader;

#[async_trait]
impl BackendLoader for NullBackendLoader {
    async fn start(&self, plugin: &PluginRecord) -> Result<()> {
        debug!(plugin = %plugin.name, "no backend environment configured, start is a no-op");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        debug!(plugin = name, "no backend environment configured, stop is a no-op");
        Ok(())
    }
}

/// Scan `root` for plugin directories. Unreadable or malformed
/// manifests are skipped with a warning; one broken plugin must not
/// take the rest down.
#[must_use]
pub fn scan_plugins(root: &Path, store: &ConfigStore) -> Vec<PluginRecord> {
    let Some(pattern) = root.join("*").join(MANIFEST_FILE).to_str().map(str::to_string) else {
        warn!(root = %root.display(), "plugins root is not valid unicode");
        return Vec::new();
    };
    let Ok(paths) = glob::glob(&pattern) else {
        warn!(root = %root.display(), "plugins root is not globbable");
        return Vec::new();
    };

    let mut records = Vec::new();
    for manifest_path in paths.flatten() {
        match read_manifest(&manifest_path) {
            Ok((manifest, raw)) => {
                let directory = manifest_path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                records.push(PluginRecord {
                    enabled: is_plugin_enabled(store, &manifest.name),
                    common_name: manifest
                        .common_name
                        .clone()
                        .unwrap_or_else(|| manifest.name.clone()),
                    use_backend: manifest.use_backend,
                    name: manifest.name,
                    manifest: raw,
                    directory,
                });
            }
            Err(err) => {
                warn!(path = %manifest_path.display(), error = %err, "skipping broken plugin manifest");
            }
        }
    }
    records
}

fn read_manifest(path: &Path) -> Result<(PluginManifest, Value)> {
    let text = std::fs::read_to_string(path)?;
    let raw: Value = serde_json::from_str(&text)?;
    let manifest: PluginManifest = serde_json::from_value(raw.clone())?;
    if manifest.common_name.is_none() {
        debug!(path = %path.display(), "manifest has no common_name, falling back to name");
    }
    if manifest.description.is_none() {
        debug!(path = %path.display(), "manifest has no description");
    }
    Ok((manifest, raw))
}

/// Names currently listed as enabled.
#[must_use]
pub fn enabled_plugins(store: &ConfigStore) -> Vec<String> {
    store
        .get(ENABLED_PLUGINS_KEY, json!([]))
        .as_array()
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[must_use]
pub fn is_plugin_enabled(store: &ConfigStore, name: &str) -> bool {
    enabled_plugins(store).iter().any(|entry| entry == name)
}

/// Persist `name` as enabled or disabled. Inserting twice or removing
/// an absent entry are both no-ops.
pub fn toggle_plugin_status(store: &ConfigStore, name: &str, enabled: bool) {
    let mut list = enabled_plugins(store);
    let present = list.iter().any(|entry| entry == name);
    if enabled && !present {
        list.push(name.to_string());
    } else if !enabled {
        list.retain(|entry| entry != name);
    }
    store.set(ENABLED_PLUGINS_KEY, json!(list));
}

enum LifecycleJob {
    Start(PluginRecord, oneshot::Sender<Result<()>>),
    Stop(String, oneshot::Sender<Result<()>>),
    FrontendLoaded(String, oneshot::Sender<Result<()>>),
}

/// Sequences backend lifecycle work across a fixed worker pool.
pub struct PluginManager {
    store: Arc<ConfigStore>,
    root: PathBuf,
    jobs: mpsc::UnboundedSender<LifecycleJob>,
}

impl PluginManager {
    /// Spawn the worker pool. Must run inside a tokio runtime.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>, loader: Arc<dyn BackendLoader>, root: PathBuf) -> Self {
        Self::with_workers(store, loader, root, DEFAULT_WORKERS)
    }

    #[must_use]
    pub fn with_workers(
        store: Arc<ConfigStore>,
        loader: Arc<dyn BackendLoader>,
        root: PathBuf,
        workers: usize,
    ) -> Self {
        let (jobs, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        for _ in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let loader = Arc::clone(&loader);
            tokio::spawn(async move {
                loop {
                    let job = { receiver.lock().await.recv().await };
                    let Some(job) = job else { break };
                    match job {
                        LifecycleJob::Start(record, ack) => {
                            info!(plugin = %record.name, "starting backend");
                            let outcome = loader.start(&record).await;
                            if let Err(err) = &outcome {
                                error!(plugin = %record.name, error = %err, "backend failed to start");
                            }
                            let _ = ack.send(outcome);
                        }
                        LifecycleJob::Stop(name, ack) => {
                            info!(plugin = %name, "stopping backend");
                            let outcome = loader.stop(&name).await;
                            if let Err(err) = &outcome {
                                error!(plugin = %name, error = %err, "backend failed to stop");
                            }
                            let _ = ack.send(outcome);
                        }
                        LifecycleJob::FrontendLoaded(name, ack) => {
                            let outcome = loader.frontend_loaded(&name).await;
                            if let Err(err) = &outcome {
                                error!(plugin = %name, error = %err, "frontend-loaded delegation failed");
                            }
                            let _ = ack.send(outcome);
                        }
                    }
                }
            });
        }
        Self { store, root, jobs }
    }

    #[must_use]
    pub fn plugins_root(&self) -> &Path {
        &self.root
    }

    /// Fresh scan of the plugins root against the current enabled set.
    #[must_use]
    pub fn scan(&self) -> Vec<PluginRecord> {
        scan_plugins(&self.root, &self.store)
    }

    /// Queue a backend start. The receiver resolves when the loader is
    /// done with it.
    pub fn queue_start(&self, record: PluginRecord) -> oneshot::Receiver<Result<()>> {
        let (ack, done) = oneshot::channel();
        self.submit(LifecycleJob::Start(record, ack));
        done
    }

    /// Queue a backend stop.
    pub fn queue_stop(&self, name: String) -> oneshot::Receiver<Result<()>> {
        let (ack, done) = oneshot::channel();
        self.submit(LifecycleJob::Stop(name, ack));
        done
    }

    fn submit(&self, job: LifecycleJob) {
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
            let (LifecycleJob::Start(_, ack)
            | LifecycleJob::Stop(_, ack)
            | LifecycleJob::FrontendLoaded(_, ack)) = job;
            let _ = ack.send(Err(Error::plugin("lifecycle workers are gone")));
        }
    }

    /// Flip `name` on or off: persist the new state, then queue the
    /// matching backend work.
    ///
    /// # Errors
    /// Enabling a plugin that does not exist on disk fails without
    /// touching the store.
    pub fn toggle(&self, name: &str, enabled: bool) -> Result<oneshot::Receiver<Result<()>>> {
        if enabled {
            let record = self
                .scan()
                .into_iter()
                .find(|record| record.name == name)
                .ok_or_else(|| Error::not_found(format!("no plugin named {name:?}")))?;
            toggle_plugin_status(&self.store, name, true);
            if record.use_backend {
                Ok(self.queue_start(record))
            } else {
                Ok(resolved_ack())
            }
        } else {
            toggle_plugin_status(&self.store, name, false);
            Ok(self.queue_stop(name.to_string()))
        }
    }

    /// Delegate a frontend-loaded announcement to the plugin's backend.
    /// Frontend-only plugins and unknown names are acked immediately;
    /// the announcement itself is fire-and-forget either way.
    pub fn frontend_loaded(&self, name: &str) -> oneshot::Receiver<Result<()>> {
        match self.scan().into_iter().find(|record| record.name == name) {
            Some(record) if record.use_backend => {
                debug!(plugin = %name, "delegating frontend load to the backend");
                let (ack, done) = oneshot::channel();
                self.submit(LifecycleJob::FrontendLoaded(record.name, ack));
                done
            }
            Some(_) => resolved_ack(),
            None => {
                warn!(plugin = %name, "frontend load reported for an unknown plugin");
                resolved_ack()
            }
        }
    }

    /// Queue starts for everything enabled that wants a backend.
    /// Returns the acks keyed by plugin name.
    #[must_use]
    pub fn start_enabled(&self) -> Vec<(String, oneshot::Receiver<Result<()>>)> {
        self.scan()
            .into_iter()
            .filter(|record| record.enabled && record.use_backend)
            .map(|record| (record.name.clone(), self.queue_start(record)))
            .collect()
    }

    /// Log the hosting report: every discovered plugin and its state.
    pub fn report(&self) {
        let records = self.scan();
        info!(count = records.len(), "hosting query");
        for record in &records {
            info!(
                plugin = %record.name,
                common_name = %record.common_name,
                enabled = record.enabled,
                backend = record.use_backend,
                "discovered plugin"
            );
        }
    }
}

fn resolved_ack() -> oneshot::Receiver<Result<()>> {
    let (ack, done) = oneshot::channel();
    let _ = ack.send(Ok(()));
    done
}
