//! Listener-observable JSON settings store.
//!
//! One store instance is the process-wide source of truth for user settings.
//! Values live in two layers: `defaults` (registered once per key at startup)
//! and `data` (the persisted document). Reads fall back from `data` to
//! `defaults`; writes go to `data`, are persisted, and fan out to registered
//! change listeners.
//!
//! Locking: the tree mutex is never held while listeners run, so a listener
//! may call back into `get`/`set` on the same store. Disk writes are
//! serialized by a separate save lock and land via a temp file renamed onto
//! the real path, so the persisted file is valid JSON even if the process
//! dies mid-save.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::error::Result;

/// Change listener signature: `(dotted path, old value, new value)`.
pub type ChangeListener = Arc<dyn Fn(&str, &Value, &Value) + Send + Sync>;

/// Handle returned by [`ConfigStore::register_listener`], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Tree {
    defaults: Value,
    data: Value,
}

/// Thread-safe settings store with dotted-path access and change
/// notification.
pub struct ConfigStore {
    tree: Mutex<Tree>,
    listeners: Mutex<Vec<(ListenerId, ChangeListener)>>,
    next_listener: AtomicU64,
    save_lock: Mutex<()>,
    path: PathBuf,
}

impl ConfigStore {
    /// Create a store persisting to `path`, seeded with the given defaults
    /// document. Call [`load`](Self::load) afterwards to pull in any existing
    /// on-disk state.
    #[must_use]
    pub fn new(path: PathBuf, defaults: Value) -> Self {
        Self {
            tree: Mutex::new(Tree {
                defaults,
                data: Value::Object(Map::new()),
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            save_lock: Mutex::new(()),
            path,
        }
    }

    /// The path this store persists to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the value at a dotted path, falling back to the registered
    /// default and then to `default`. Never fails; an absent path returns
    /// the fallback.
    #[must_use]
    pub fn get(&self, path: &str, default: Value) -> Value {
        let tree = self.tree.lock();
        lookup(&tree.data, path)
            .or_else(|| lookup(&tree.defaults, path))
            .cloned()
            .unwrap_or(default)
    }

    /// Typed convenience over [`get`](Self::get) for boolean flags.
    #[must_use]
    pub fn get_bool(&self, path: &str, default: bool) -> bool {
        self.get(path, Value::Bool(default))
            .as_bool()
            .unwrap_or(default)
    }

    /// Typed convenience over [`get`](Self::get) for string settings.
    #[must_use]
    pub fn get_string(&self, path: &str, default: &str) -> String {
        match self.get(path, Value::String(default.to_string())) {
            Value::String(s) => s,
            _ => default.to_string(),
        }
    }

    /// Write `value` at a dotted path, persist, and notify listeners.
    /// A write that does not change the stored value is a no-op.
    pub fn set(&self, path: &str, value: Value) {
        self.set_with(path, value, false);
    }

    /// Like [`set`](Self::set) but suppresses listener notification. The
    /// write is still persisted.
    pub fn set_silent(&self, path: &str, value: Value) {
        self.set_with(path, value, true);
    }

    fn set_with(&self, path: &str, value: Value, skip_propagation: bool) {
        let old = {
            let mut tree = self.tree.lock();
            let Some(slot) = ensure_slot(&mut tree.data, path) else {
                warn!(path, "cannot set config key through a non-object parent");
                return;
            };
            if *slot == value {
                return;
            }
            std::mem::replace(slot, value.clone())
        };

        if let Err(err) = self.save() {
            warn!(path, error = %err, "failed to persist settings");
        }
        if !skip_propagation {
            self.notify(path, &old, &value);
        }
    }

    /// Register the fallback value for a key. Idempotent; meant to be called
    /// once per key at subsystem init.
    pub fn set_default(&self, path: &str, value: Value) {
        let mut tree = self.tree.lock();
        if let Some(slot) = ensure_slot(&mut tree.defaults, path) {
            *slot = value;
        }
    }

    /// The full effective document: defaults overlaid with persisted data.
    #[must_use]
    pub fn get_all(&self) -> Value {
        let tree = self.tree.lock();
        let mut merged = tree.defaults.clone();
        overlay(&mut merged, &tree.data);
        merged
    }

    /// Load persisted settings from disk, then merge the defaults document
    /// into them so keys introduced by an upgrade appear without clobbering
    /// anything the user customized.
    ///
    /// I/O and parse failures degrade to the defaults document rather than
    /// failing startup.
    pub fn load(&self) {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value @ Value::Object(_)) => value,
                Ok(_) => {
                    warn!(path = %self.path.display(), "settings file is not a JSON object, resetting");
                    Value::Object(Map::new())
                }
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "settings file is corrupt, resetting");
                    Value::Object(Map::new())
                }
            },
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "no settings file yet, starting from defaults");
                Value::Object(Map::new())
            }
        };

        let added = {
            let mut tree = self.tree.lock();
            tree.data = data;
            let defaults = tree.defaults.clone();
            let mut added = Vec::new();
            merge_defaults(&mut tree.data, &defaults, "", &mut added);
            added
        };

        if let Err(err) = self.save() {
            warn!(error = %err, "failed to persist settings after load");
        }
        for (path, value) in added {
            self.notify(&path, &Value::Null, &value);
        }
    }

    /// Persist the current data layer. Safe to call concurrently; writers
    /// queue on the save lock and each write is atomic (temp file + rename).
    pub fn save(&self) -> Result<()> {
        let snapshot = self.tree.lock().data.clone();
        let _guard = self.save_lock.lock();

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut file = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut file, &snapshot)?;
        file.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }

    /// Register a change listener. Listeners run outside the tree lock and
    /// may re-enter the store.
    pub fn register_listener(&self, listener: ChangeListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Remove a previously registered listener. Returns `false` if the id is
    /// unknown.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    fn notify(&self, path: &str, old: &Value, new: &Value) {
        let snapshot: Vec<ChangeListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(path, old, new);
        }
    }
}

/// The stock settings document: every known key with its shipped default.
#[must_use]
pub fn default_settings() -> Value {
    json!({
        "general": {
            "accentColor": "DEFAULT_ACCENT_COLOR",
            "checkForMillenniumUpdates": true,
            "checkForPluginAndThemeUpdates": true,
            "injectJavascript": true,
            "injectCSS": true,
        },
        "misc": {
            "verboseLogging": false,
        },
        "themes": {
            "activeTheme": "default",
            "allowedStyles": true,
            "allowedScripts": true,
            "conditions": {},
            "themeColors": {},
        },
        "notifications": {
            "showNotifications": true,
            "showUpdateNotifications": true,
        },
        "plugins": {
            "enabledPlugins": [],
        },
    })
}

/// Default location of the settings file, honoring the
/// `MILLENNIUM_CONFIG_DIR` override.
#[must_use]
pub fn default_settings_path() -> PathBuf {
    if let Ok(dir) = std::env::var("MILLENNIUM_CONFIG_DIR") {
        return PathBuf::from(dir).join("settings.json");
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("millennium")
        .join("settings.json")
}

/// Default root for plugin directories.
#[must_use]
pub fn default_plugins_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("millennium")
        .join("plugins")
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for part in path.split('.') {
        node = node.as_object()?.get(part)?;
    }
    Some(node)
}

/// Walk to the slot for `path` inside `root`, creating intermediate objects.
/// Returns `None` when an intermediate key exists but is not an object.
fn ensure_slot<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut node = root;
    for part in path.split('.') {
        let map = node.as_object_mut()?;
        node = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Some(node)
}

/// Recursively fold `incoming` defaults into `current`, keeping every value
/// the user already has and recording each added `(path, value)` pair.
fn merge_defaults(current: &mut Value, incoming: &Value, path: &str, added: &mut Vec<(String, Value)>) {
    let Some(incoming_map) = incoming.as_object() else {
        return;
    };
    let Some(current_map) = current.as_object_mut() else {
        return;
    };
    for (key, default_value) in incoming_map {
        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };
        match current_map.get_mut(key) {
            Some(existing) => {
                if existing.is_object() && default_value.is_object() {
                    merge_defaults(existing, default_value, &child_path, added);
                }
            }
            None => {
                current_map.insert(key.clone(), default_value.clone());
                added.push((child_path, default_value.clone()));
            }
        }
    }
}

/// Recursively overlay `data` onto `base`; `data` wins on conflicts.
fn overlay(base: &mut Value, data: &Value) {
    let Some(data_map) = data.as_object() else {
        *base = data.clone();
        return;
    };
    if !base.is_object() {
        *base = data.clone();
        return;
    }
    if let Some(base_map) = base.as_object_mut() {
        for (key, value) in data_map {
            match base_map.get_mut(key) {
                Some(slot) => overlay(slot, value),
                None => {
                    base_map.insert(key.clone(), value.clone());
                }
            }
        }
    }
}
