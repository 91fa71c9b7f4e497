//! Interception engine.
//!
//! A state machine over the DevTools frame stream. [`dispatch`] takes
//! one inbound frame and returns the outbound commands it provokes;
//! it performs no socket work itself, which is what makes the whole
//! protocol exchange testable as plain values.
//!
//! [`dispatch`]: InterceptEngine::dispatch

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ConfigStore;
use crate::encoding;
use crate::hooks::assets;
use crate::hooks::patcher::{DocumentPatcher, InjectionPolicy};
use crate::hooks::registry::HookRegistry;

/// Fixed ids for the engine's own commands. Body fetches use negative,
/// strictly decreasing ids instead, so the two ranges cannot collide
/// with each other or with anything else sharing the connection.
pub const FETCH_ENABLE_ID: i64 = 3242;
pub const CONTINUE_REQUEST_ID: i64 = 0;
pub const FULFILL_REQUEST_ID: i64 = 63453;
pub const GET_TARGETS_ID: i64 = 96876;
pub const ATTACH_TARGET_ID: i64 = 567844;
pub const SET_BYPASS_CSP_ID: i64 = 1235377;

/// Body-fetch ids start below this and only ever decrease.
const BODY_REQUEST_ID_SEED: i64 = -69;

/// How long an unanswered body fetch may sit before eviction.
const PENDING_TTL: Duration = Duration::from_secs(30);

const REDIRECT_CODES: [i64; 5] = [301, 302, 303, 307, 308];

/// A paused document response waiting for its body to come back.
pub struct PendingRequest {
    pub request_id: String,
    pub resource_type: String,
    /// The original `Fetch.requestPaused` frame; status and headers are
    /// lifted from it when the patched document is fulfilled.
    pub paused: Value,
    created: Instant,
}

/// Per-connection protocol state plus the shared hook machinery.
pub struct InterceptEngine {
    registry: Arc<HookRegistry>,
    store: Arc<ConfigStore>,
    patcher: DocumentPatcher,
    pending: HashMap<i64, PendingRequest>,
    next_body_id: i64,
}

impl InterceptEngine {
    #[must_use]
    pub fn new(registry: Arc<HookRegistry>, store: Arc<ConfigStore>, patcher: DocumentPatcher) -> Self {
        Self {
            registry,
            store,
            patcher,
            pending: HashMap::new(),
            next_body_id: BODY_REQUEST_ID_SEED,
        }
    }

    /// Commands to send right after the connection opens: enable fetch
    /// interception for documents and the asset hosts, then start the
    /// CSP-bypass fan-out over existing page targets.
    #[must_use]
    pub fn setup_commands(&self) -> Vec<Value> {
        let mut patterns = vec![json!({
            "urlPattern": "*",
            "resourceType": "Document",
            "requestStage": "Response",
        })];
        for host in assets::VirtualHost::ALL {
            patterns.push(json!({
                "urlPattern": format!("{}*", host.base()),
                "requestStage": "Request",
            }));
        }
        vec![
            json!({
                "id": FETCH_ENABLE_ID,
                "method": "Fetch.enable",
                "params": { "patterns": patterns },
            }),
            Self::get_targets(),
        ]
    }

    /// Feed one inbound frame through the machine.
    pub fn dispatch(&mut self, frame: &Value) -> Vec<Value> {
        let mut out = Vec::new();
        match frame.get("method").and_then(Value::as_str) {
            Some("Fetch.requestPaused") => self.on_request_paused(frame, &mut out),
            Some("Target.attachedToTarget") => Self::on_target_attached(frame, &mut out),
            _ => {}
        }
        match frame.get("id").and_then(Value::as_i64) {
            Some(GET_TARGETS_ID) => Self::on_targets_listed(frame, &mut out),
            Some(id) if id < 0 => self.on_body_received(id, frame, &mut out),
            _ => {}
        }
        out
    }

    fn on_request_paused(&mut self, frame: &Value, out: &mut Vec<Value>) {
        let params = &frame["params"];
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
            warn!("paused request without a requestId");
            return;
        };
        let url = params
            .pointer("/request/url")
            .and_then(Value::as_str)
            .unwrap_or_default();

        // asset-host requests never reach the network, they are answered
        // from disk at the request stage
        if assets::is_virtual_request(url) {
            out.push(json!({
                "id": FULFILL_REQUEST_ID,
                "method": "Fetch.fulfillRequest",
                "params": assets::fulfill_from_disk(request_id, url),
            }));
            return;
        }

        // payment and captcha pages keep their stock response
        if self.patcher.is_passthrough(url) {
            debug!(url, "releasing passthrough page untouched");
            out.push(Self::continue_request(request_id));
            return;
        }

        // patching a redirect body would strand the navigation
        if let Some(code) = params.get("responseStatusCode").and_then(Value::as_i64) {
            if REDIRECT_CODES.contains(&code) {
                debug!(url, code, "passing redirect through");
                out.push(Self::continue_request(request_id));
                return;
            }
        }

        self.next_body_id -= 1;
        let id = self.next_body_id;
        let resource_type = params
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.pending.insert(
            id,
            PendingRequest {
                request_id: request_id.to_string(),
                resource_type,
                paused: frame.clone(),
                created: Instant::now(),
            },
        );
        out.push(json!({
            "id": id,
            "method": "Fetch.getResponseBody",
            "params": { "requestId": request_id },
        }));
    }

    fn on_body_received(&mut self, id: i64, frame: &Value, out: &mut Vec<Value>) {
        let Some(pending) = self.pending.remove(&id) else {
            // already evicted, or a reply this engine never asked for
            return;
        };

        if let Some(error) = frame.get("error") {
            debug!(request_id = %pending.request_id, %error, "body fetch failed");
        }

        let encoded = frame
            .pointer("/result/base64Encoded")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let decoded = if encoded {
            frame
                .pointer("/result/body")
                .and_then(Value::as_str)
                .and_then(|text| match encoding::decode_body(text) {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        warn!(request_id = %pending.request_id, error = %err, "response body undecodable");
                        None
                    }
                })
        } else {
            None
        };

        // no usable body: release the original response untouched so the
        // page loads unthemed instead of hanging
        let Some(bytes) = decoded else {
            out.push(Self::continue_request(&pending.request_id));
            return;
        };

        let original = String::from_utf8_lossy(&bytes);
        let url = pending
            .paused
            .pointer("/params/request/url")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let hooks = self.registry.snapshot();
        let policy = InjectionPolicy::from_store(&self.store);
        let patched = self
            .patcher
            .patch_document(url, &original, &hooks, &policy);

        out.push(json!({
            "id": FULFILL_REQUEST_ID,
            "method": "Fetch.fulfillRequest",
            "params": DocumentPatcher::fulfill_params(
                &pending.paused["params"],
                &pending.request_id,
                &patched,
            ),
        }));
        // a patched document may have opened fresh popups; re-sweep the
        // target list so they get the CSP bypass too
        out.push(Self::get_targets());
    }

    fn on_targets_listed(frame: &Value, out: &mut Vec<Value>) {
        let Some(targets) = frame.pointer("/result/targetInfos").and_then(Value::as_array) else {
            return;
        };
        for target in targets {
            let target_type = target.get("type").and_then(Value::as_str).unwrap_or_default();
            let url = target.get("url").and_then(Value::as_str).unwrap_or_default();
            if target_type != "page"
                || url.contains("steamloopback.host")
                || url.contains("about:blank?")
            {
                continue;
            }
            let Some(target_id) = target.get("targetId").and_then(Value::as_str) else {
                continue;
            };
            out.push(json!({
                "id": ATTACH_TARGET_ID,
                "method": "Target.attachToTarget",
                "params": { "targetId": target_id, "flatten": true },
            }));
        }
    }

    fn on_target_attached(frame: &Value, out: &mut Vec<Value>) {
        let Some(session_id) = frame.pointer("/params/sessionId").and_then(Value::as_str) else {
            return;
        };
        out.push(json!({
            "id": SET_BYPASS_CSP_ID,
            "method": "Page.setBypassCSP",
            "sessionId": session_id,
            "params": { "enabled": true },
        }));
    }

    fn continue_request(request_id: &str) -> Value {
        json!({
            "id": CONTINUE_REQUEST_ID,
            "method": "Fetch.continueRequest",
            "params": { "requestId": request_id },
        })
    }

    fn get_targets() -> Value {
        json!({ "id": GET_TARGETS_ID, "method": "Target.getTargets" })
    }

    /// Evict entries older than the standard TTL. A reply that never
    /// comes (renderer killed mid-navigation) must not pin its entry
    /// forever.
    pub fn sweep_expired(&mut self) -> usize {
        self.sweep_older_than(PENDING_TTL)
    }

    fn sweep_older_than(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.created) >= ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(pending) = self.pending.remove(id) {
                warn!(
                    request_id = %pending.request_id,
                    resource_type = %pending.resource_type,
                    "evicting stale paused request"
                );
            }
        }
        stale.len()
    }

    /// Drop every in-flight entry. Called when the connection dies;
    /// the new connection starts from a clean slate.
    pub fn purge(&mut self) -> usize {
        let count = self.pending.len();
        if count > 0 {
            warn!(pending = count, "dropping in-flight requests on disconnect");
        }
        self.pending.clear();
        count
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}
