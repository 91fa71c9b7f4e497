//! Millennium - a runtime customization layer for the Steam client.
//!
//! Steam's UI is a set of Chromium web views. Millennium attaches to
//! the client's remote debugger, intercepts document responses at the
//! network layer, and splices theme stylesheets and plugin scripts into
//! them before the renderer ever sees the page. Assets referenced by
//! patched documents resolve through made-up https origins that are
//! answered from disk, so nothing real is ever fetched.
//!
//! The crate is organized along that data flow:
//!
//! - [`transport`]: target discovery and the DevTools websocket client
//! - [`hooks`]: the hook registry, virtual asset hosts, document
//!   patching, and the interception state machine
//! - [`ipc`]: the local RPC surface the browser-side shims call into
//! - [`plugins`]: plugin discovery and backend lifecycle
//! - [`config`]: the persistent settings store with change listeners
//! - [`app`]: constructs all of the above and keeps it running

pub mod app;
pub mod config;
pub mod encoding;
pub mod error;
pub mod hooks;
pub mod ipc;
pub mod plugins;
pub mod transport;

pub use error::{Error, Result};
