#![deny(unused)]
//! Core types and error definitions for jsbox.
//!
//! This crate provides the building blocks shared by the jsbox client: the
//! error taxonomy, the capability vocabulary negotiated with the connected
//! service, and isolate configuration. It deliberately carries no async
//! runtime dependency so it stays usable from synchronous contexts.

pub mod error;
pub mod features;
pub mod settings;

pub use error::{Error, Result};
pub use features::{translate_service_features, Feature};
pub use settings::IsolateSettings;
