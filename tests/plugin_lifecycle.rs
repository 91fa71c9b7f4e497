//! Plugin lifecycle driven the way the frontend drives it: rpc calls
//! against the built-in registry, with real manifests on disk and the
//! settings store recording the enabled set.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use millennium::app::{build_rpc_registry, SharedFrontend};
use millennium::config::{default_settings, ConfigStore};
use millennium::hooks::HookRegistry;
use millennium::ipc::RpcRegistry;
use millennium::plugins::{enabled_plugins, NullBackendLoader, PluginManager};

fn write_manifest(root: &std::path::Path, dir: &str, manifest: &Value) {
    let plugin = root.join(dir);
    std::fs::create_dir_all(&plugin).unwrap();
    std::fs::write(
        plugin.join("plugin.json"),
        serde_json::to_string_pretty(manifest).unwrap(),
    )
    .unwrap();
}

fn fixture() -> (tempfile::TempDir, Arc<ConfigStore>, Arc<RpcRegistry>) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("plugins");
    write_manifest(
        dir.path(),
        "plugins/alpha",
        &json!({ "name": "alpha", "common_name": "Alpha Theme Tools", "useBackend": false }),
    );
    write_manifest(dir.path(), "plugins/beta", &json!({ "name": "beta" }));

    let store = Arc::new(ConfigStore::new(
        dir.path().join("settings.json"),
        default_settings(),
    ));
    let registry = Arc::new(HookRegistry::new());
    let manager = Arc::new(PluginManager::new(
        Arc::clone(&store),
        Arc::new(NullBackendLoader),
        root,
    ));
    let shared = Arc::new(SharedFrontend::new(0, Arc::clone(&manager), Instant::now()));
    let rpc = build_rpc_registry(&store, &registry, &manager, &shared);
    (dir, store, rpc)
}

#[tokio::test]
async fn find_all_plugins_reflects_the_manifests_on_disk() {
    let (_dir, _store, rpc) = fixture();

    let listing = rpc.dispatch("core.find_all_plugins", json!({})).unwrap();
    let plugins = listing.as_array().unwrap();
    assert_eq!(plugins.len(), 2);

    assert_eq!(plugins[0]["name"], "alpha");
    assert_eq!(plugins[0]["commonName"], "Alpha Theme Tools");
    assert_eq!(plugins[0]["useBackend"], false);
    assert_eq!(plugins[0]["enabled"], false);

    assert_eq!(plugins[1]["name"], "beta");
    assert_eq!(plugins[1]["commonName"], "beta");
    assert_eq!(plugins[1]["useBackend"], true);
}

#[tokio::test]
async fn toggling_over_rpc_updates_the_store_and_the_listing() {
    let (_dir, store, rpc) = fixture();

    let reply = rpc
        .dispatch(
            "core.toggle_plugin_status",
            json!({ "pluginName": "beta", "enabled": true }),
        )
        .unwrap();
    assert_eq!(reply, json!(true));
    assert_eq!(enabled_plugins(&store), vec!["beta".to_string()]);

    let listing = rpc.dispatch("core.find_all_plugins", json!({})).unwrap();
    let beta = listing
        .as_array()
        .unwrap()
        .iter()
        .find(|plugin| plugin["name"] == "beta")
        .unwrap();
    assert_eq!(beta["enabled"], true);

    rpc.dispatch(
        "core.toggle_plugin_status",
        json!({ "pluginName": "beta", "enabled": false }),
    )
    .unwrap();
    assert!(enabled_plugins(&store).is_empty());
}

#[tokio::test]
async fn unknown_plugins_cannot_be_enabled() {
    let (_dir, store, rpc) = fixture();

    let err = rpc
        .dispatch(
            "core.toggle_plugin_status",
            json!({ "pluginName": "ghost", "enabled": true }),
        )
        .unwrap_err();
    assert!(err.to_string().contains("ghost"));
    assert!(enabled_plugins(&store).is_empty());
}

#[tokio::test]
async fn frontend_only_plugins_enable_without_backend_work() {
    let (_dir, store, rpc) = fixture();

    rpc.dispatch(
        "core.toggle_plugin_status",
        json!({ "pluginName": "alpha", "enabled": true }),
    )
    .unwrap();
    assert_eq!(enabled_plugins(&store), vec!["alpha".to_string()]);
}
