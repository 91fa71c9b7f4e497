//! Virtual asset hosts.
//!
//! Hooked documents reference local theme and plugin files through
//! made-up https origins that never resolve in DNS. The interception
//! engine pauses those requests at the network layer and this module
//! answers them from disk. Three hosts exist and the set is closed;
//! every piece of url handling goes through [`classify`] so the host
//! scheme lives in exactly one place.

use std::path::PathBuf;

use serde_json::{json, Value};
use tracing::warn;

use crate::encoding;

pub const JAVASCRIPT_HOST: &str = "https://js.millennium.app/";
pub const STYLESHEET_HOST: &str = "https://css.millennium.app/";
/// Pre-split host that served both kinds; old themes still emit it.
pub const LEGACY_HOST: &str = "https://pseudo.millennium.app/";

/// One of the recognized asset origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualHost {
    Javascript,
    Stylesheet,
    Legacy,
}

impl VirtualHost {
    pub const ALL: [Self; 3] = [Self::Javascript, Self::Stylesheet, Self::Legacy];

    #[must_use]
    pub const fn base(self) -> &'static str {
        match self {
            Self::Javascript => JAVASCRIPT_HOST,
            Self::Stylesheet => STYLESHEET_HOST,
            Self::Legacy => LEGACY_HOST,
        }
    }
}

/// Match `url` against the virtual hosts. Returns the host and the
/// encoded remainder after its base.
#[must_use]
pub fn classify(url: &str) -> Option<(VirtualHost, &str)> {
    for host in VirtualHost::ALL {
        if let Some(index) = url.find(host.base()) {
            return Some((host, &url[index + host.base().len()..]));
        }
    }
    None
}

/// Whether a paused request targets one of the asset origins.
#[must_use]
pub fn is_virtual_request(url: &str) -> bool {
    classify(url).is_some()
}

/// Translate a virtual-host url back to the on-disk path it encodes.
#[must_use]
pub fn resolve(url: &str) -> Option<PathBuf> {
    classify(url).map(|(_, remainder)| encoding::path_from_url(remainder))
}

/// Build `Fetch.fulfillRequest` params answering `url` from disk.
///
/// Missing or unreadable files become a 404 with an empty body; the
/// page decides what a missing stylesheet means. Headers always carry a
/// wildcard CORS grant because the fake origin never matches the
/// document origin.
#[must_use]
pub fn fulfill_from_disk(request_id: &str, url: &str) -> Value {
    let path = resolve(url);
    let content = path.as_ref().and_then(|path| match std::fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "hooked asset unreadable");
            None
        }
    });

    let (code, phrase, body) = match (&path, content) {
        (Some(_), Some(bytes)) => (200, "OK".to_string(), encoding::encode_body(&bytes)),
        (Some(path), None) => (
            404,
            format!("millennium couldn't read {}", path.display()),
            String::new(),
        ),
        (None, _) => (404, "millennium unknown asset host".to_string(), String::new()),
    };

    let content_type = path.as_deref().map_or("text/plain", encoding::content_type_for);

    json!({
        "requestId": request_id,
        "responseCode": code,
        "responsePhrase": phrase,
        "responseHeaders": [
            { "name": "Access-Control-Allow-Origin", "value": "*" },
            { "name": "Content-Type", "value": content_type },
        ],
        "body": body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn classify_recognizes_every_host() {
        assert_eq!(
            classify("https://js.millennium.app/a/b.js").map(|(h, r)| (h, r.to_string())),
            Some((VirtualHost::Javascript, "a/b.js".to_string()))
        );
        assert_eq!(
            classify("https://css.millennium.app/a.css").map(|(h, _)| h),
            Some(VirtualHost::Stylesheet)
        );
        assert_eq!(
            classify("https://pseudo.millennium.app/x").map(|(h, _)| h),
            Some(VirtualHost::Legacy)
        );
        assert_eq!(classify("https://store.steampowered.com/"), None);
    }

    #[cfg(not(windows))]
    #[test]
    fn resolve_round_trips_an_absolute_path() {
        let url = encoding::url_from_path(STYLESHEET_HOST, "/opt/millennium/skins/dark.css");
        assert_eq!(
            resolve(&url),
            Some(PathBuf::from("/opt/millennium/skins/dark.css"))
        );
    }

    #[test]
    fn resolve_strips_query_strings() {
        let resolved = resolve("https://css.millennium.app/skins/a.css?contentType=css").unwrap();
        assert!(resolved.to_string_lossy().ends_with("skins/a.css"));
    }

    #[test]
    fn missing_file_becomes_a_404_with_cors_headers() {
        let params = fulfill_from_disk("req-1", "https://css.millennium.app/no/such/file.css");
        assert_eq!(params["requestId"], "req-1");
        assert_eq!(params["responseCode"], 404);
        assert_eq!(params["body"], "");
        assert_eq!(
            params["responseHeaders"][0]["name"],
            "Access-Control-Allow-Origin"
        );
        assert_eq!(params["responseHeaders"][0]["value"], "*");
    }

    #[test]
    fn readable_file_is_served_base64_with_its_mime_type() {
        let mut file = tempfile::Builder::new()
            .suffix(".css")
            .tempfile()
            .unwrap();
        file.write_all(b"body { margin: 0 }").unwrap();

        let url = encoding::url_from_path(STYLESHEET_HOST, &file.path().to_string_lossy());
        let params = fulfill_from_disk("req-2", &url);

        assert_eq!(params["responseCode"], 200);
        assert_eq!(params["responsePhrase"], "OK");
        assert_eq!(params["responseHeaders"][1]["value"], "text/css");
        assert_eq!(
            encoding::decode_body(params["body"].as_str().unwrap()).unwrap(),
            b"body { margin: 0 }"
        );
    }
}
