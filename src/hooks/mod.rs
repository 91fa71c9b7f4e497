//! Webkit hook pipeline.
//!
//! The pieces, in data-flow order: [`registry`] holds the ordered set of
//! content hooks, [`assets`] maps virtual-host urls onto disk files,
//! [`patcher`] splices loaders and stylesheets into intercepted HTML,
//! and [`engine`] drives all of it from the DevTools frame stream.

pub mod assets;
pub mod engine;
pub mod patcher;
pub mod registry;

pub use assets::VirtualHost;
pub use engine::InterceptEngine;
pub use patcher::{DocumentPatcher, InjectionPolicy};
pub use registry::{HookDescriptor, HookKind, HookRegistry};
