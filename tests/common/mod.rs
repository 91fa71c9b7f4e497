//! Common test infrastructure for `millennium`.
//!
//! Shared across the integration suites:
//! - A mock target-listing HTTP server standing in for Steam's
//!   `/json` discovery routes
//! - A mock DevTools websocket peer that records inbound frames and
//!   replies from a scripted table

#![allow(dead_code)]

pub mod server;

#[allow(unused_imports)]
pub use server::{MockCdpServer, MockHttpServer};
