#![deny(unused)]
//! Lifecycle management for a sandboxed JavaScript process.
//!
//! The sandboxed process is reached through a platform binding facility and
//! evaluates JavaScript in one or more isolates. This crate provides the
//! client-side manager: asynchronous connect behind a process-wide
//! connection gate, isolate creation, an ordered evaluate-and-await
//! protocol with cancellation and termination, capability negotiation, and
//! named-data transfer.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  caller                                   │
//! │    ↓ connect / create_isolate / evaluate  │
//! ├───────────────────────────────────────────┤
//! │  JsSandbox / JsIsolate                    │
//! │    pending-request registry,              │
//! │    per-isolate submission worker          │
//! ├───────────────────────────────────────────┤
//! │  ServiceBinder + service stubs            │
//! │    ↓ platform IPC                         │
//! ├───────────────────────────────────────────┤
//! │  sandboxed process (isolated)             │
//! │    one JS global scope per isolate        │
//! └───────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use jsbox_client::{ConnectionGate, JsSandbox};
//!
//! let gate = Arc::new(ConnectionGate::new());
//! let sandbox = JsSandbox::connect(binder, gate).await?;
//! let isolate = sandbox.create_isolate().await?;
//! let greeting = isolate.evaluate("'hello'")?.await?;
//! isolate.close();
//! sandbox.close();
//! ```

pub mod connection;
pub mod isolate;
pub mod mock;
mod pending;
pub mod sandbox;
pub mod service;

pub use connection::{ConnectionGate, PendingConnection};
pub use isolate::{JsIsolate, PendingEvaluation};
pub use sandbox::JsSandbox;
pub use service::{
    ConnectionEvent, EvaluationCallback, EvaluationErrorKind, IsolateHandle, SandboxService,
    ServiceBinder, SizedByteSource,
};
