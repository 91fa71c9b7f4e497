//! Transport layer for the DevTools control plane.
//!
//! Two concerns live here: finding debugger targets through the local
//! HTTP listing endpoint ([`discovery`]) and holding a websocket open to
//! one of them ([`socket`]). Both are policy-free; reconnection and
//! frame interpretation belong to the caller.

pub mod discovery;
pub mod socket;

pub use discovery::{DebuggerTarget, Discovery, DEFAULT_DEBUGGER_PORT, SHARED_JS_CONTEXT};
pub use socket::{connect, FrameHandler, SocketHandle};
