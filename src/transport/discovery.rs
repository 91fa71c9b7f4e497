//! Debugger target discovery.
//!
//! Steam exposes a Chromium remote-debugging listener on localhost. Its
//! `/json` route lists every debuggable target (pages, shared contexts,
//! service workers) and `/json/version` describes the browser-wide
//! endpoint. Discovery is a thin typed client over those two routes.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// Port the Steam client opens its debugger on unless told otherwise.
pub const DEFAULT_DEBUGGER_PORT: u16 = 8080;

/// Title of the always-alive JavaScript VM target that hosts the
/// client UI state. Frontend shims are evaluated in this context.
pub const SHARED_JS_CONTEXT: &str = "SharedJSContext";

/// Interval between `/json` polls while waiting for a target to appear.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-request timeout for the listing endpoint. The listener is local,
/// so anything slower than this means it is not up yet.
const HTTP_TIMEOUT: Duration = Duration::from_secs(3);

/// One entry from the `/json` target listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebuggerTarget {
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub target_type: String,
    #[serde(default)]
    pub url: String,
    /// Absent when another debugger is already attached to the target.
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

/// Typed client for the local debugger listing endpoint.
#[derive(Clone)]
pub struct Discovery {
    client: reqwest::Client,
    base: Url,
}

impl Discovery {
    /// Build a discovery client against `127.0.0.1:port`.
    ///
    /// # Errors
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(port: u16) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let base = Url::parse(&format!("http://127.0.0.1:{port}"))
            .map_err(|err| Error::transport(format!("invalid debugger endpoint: {err}")))?;
        Ok(Self { client, base })
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.base
    }

    /// Fetch the full target listing.
    ///
    /// # Errors
    /// Fails when the listener is unreachable or replies with a non-JSON
    /// body, which both mean the Steam debugger is not up yet.
    pub async fn list_targets(&self) -> Result<Vec<DebuggerTarget>> {
        let endpoint = self
            .base
            .join("/json")
            .map_err(|err| Error::transport(format!("bad listing route: {err}")))?;
        let targets = self
            .client
            .get(endpoint)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<DebuggerTarget>>()
            .await?;
        Ok(targets)
    }

    /// Resolve the websocket url of the target titled `common_name`.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] when no target carries that title or
    /// the matching target has no debugger url left to claim.
    pub async fn discover(&self, common_name: &str) -> Result<String> {
        let targets = self.list_targets().await?;
        targets
            .into_iter()
            .find(|target| target.title == common_name)
            .and_then(|target| target.web_socket_debugger_url)
            .ok_or_else(|| Error::not_found(format!("no debugger target titled {common_name:?}")))
    }

    /// Poll `/json` until the named target shows up and return its url.
    ///
    /// Unbounded on purpose: Steam opens its debugger port at an
    /// arbitrary point during startup and the caller has nothing useful
    /// to do before the target exists.
    pub async fn discover_until_available(&self, common_name: &str) -> String {
        loop {
            match self.discover(common_name).await {
                Ok(url) => return url,
                Err(err) => {
                    debug!(target_title = common_name, error = %err, "target not ready, retrying");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Resolve the browser-wide websocket endpoint from `/json/version`.
    ///
    /// # Errors
    /// Fails when the route is unreachable or the version document does
    /// not carry a `webSocketDebuggerUrl` field.
    pub async fn browser_endpoint(&self) -> Result<String> {
        let endpoint = self
            .base
            .join("/json/version")
            .map_err(|err| Error::transport(format!("bad version route: {err}")))?;
        let version: Value = self
            .client
            .get(endpoint)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        version
            .get("webSocketDebuggerUrl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::transport("version document lacks webSocketDebuggerUrl"))
    }

    /// Poll `/json/version` until the browser endpoint is published.
    pub async fn browser_endpoint_until_available(&self) -> String {
        loop {
            match self.browser_endpoint().await {
                Ok(url) => return url,
                Err(err) => {
                    debug!(error = %err, "browser endpoint not ready, retrying");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }
}
