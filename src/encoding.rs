//! Encoding and URL utilities.
//!
//! Theme and plugin assets are addressed through virtual `https://` hosts but
//! live on disk, so the hook pipeline constantly translates between the two
//! worlds: percent-encoding filesystem paths into URLs, decoding request URLs
//! back into paths, and base64-framing response bodies for the DevTools
//! protocol.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{Error, Result};

/// Percent-encode a path for use in a URL.
///
/// Unreserved characters and `/` pass through (path separators stay visible
/// in the URL), a space becomes `+`, everything else becomes `%XX`.
#[must_use]
pub fn url_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.as_bytes() {
        match *b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(*b as char);
            }
            b' ' => out.push('+'),
            other => {
                let _ = write!(out, "%{other:02X}");
            }
        }
    }
    out
}

/// Decode a percent-encoded URL fragment.
///
/// A `%` not followed by two hex digits is dropped rather than treated as an
/// error; decoded bytes that are not valid UTF-8 are replaced lossily.
#[must_use]
pub fn url_decode(value: &str) -> String {
    let mut out = Vec::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if i + 2 < bytes.len()
                    && bytes[i + 1].is_ascii_hexdigit()
                    && bytes[i + 2].is_ascii_hexdigit()
                {
                    let hi = hex_value(bytes[i + 1]);
                    let lo = hex_value(bytes[i + 2]);
                    out.push((hi << 4) | lo);
                    i += 2;
                }
            }
            b'+' => out.push(b' '),
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

/// Build a virtual-host URL for an on-disk asset path.
///
/// On Unix the leading `/` is folded into the host's trailing slash; on
/// Windows the drive-prefixed path is appended as-is.
#[must_use]
pub fn url_from_path(base_address: &str, path: &str) -> String {
    let relative = if cfg!(windows) {
        path
    } else {
        path.strip_prefix('/').unwrap_or(path)
    };
    format!("{base_address}{}", url_encode(relative))
}

/// Translate the path portion of a virtual-host URL back into a filesystem
/// path. The query string is not part of the file path and is dropped.
#[must_use]
pub fn path_from_url(path: &str) -> PathBuf {
    let clean = path.split('?').next().unwrap_or(path);
    let decoded = url_decode(clean);
    if cfg!(windows) {
        PathBuf::from(decoded)
    } else {
        PathBuf::from(format!("/{decoded}"))
    }
}

/// Base64-encode a response body for `Fetch.fulfillRequest`.
#[must_use]
pub fn encode_body(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Base64-decode a `Fetch.getResponseBody` payload.
pub fn decode_body(data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|err| Error::protocol(format!("invalid base64 body: {err}")))
}

/// MIME type for a served asset, derived from the file extension.
#[must_use]
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("py") => "text/x-python",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("png") => "image/png",
        Some("jpeg") => "image/jpeg",
        Some("jpg") => "image/jpg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("html") => "text/html",
        _ => "text/plain",
    }
}
