//! # Enclave Sandbox
//!
//! The isolated side of the worker protocol. A worker process builds a
//! [`PluginLoader`], wraps it in a [`WorkerSession`] and hands the session
//! to [`serve_stdio`]:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use enclave_sandbox::{FactoryLoader, WorkerSession, serve_stdio};
//!
//! # async fn run() -> Result<(), enclave_plugin_protocol::ProtocolError> {
//! let loader = FactoryLoader::new();
//! let session = Arc::new(WorkerSession::new(
//!     Arc::new(loader),
//!     tokio::runtime::Handle::current(),
//! ));
//! serve_stdio(session).await
//! # }
//! ```
//!
//! ## Core Types
//!
//! - [`WorkerSession`] - per-plugin state machine and executor
//! - [`SessionDispatcher`] - frame boundary; guarantees one reply per request
//! - [`PluginLoader`] / [`FactoryLoader`] - entry point resolution and archive checks

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dispatcher;
mod error;
mod loader;
mod serve;
mod session;

pub use dispatcher::SessionDispatcher;
pub use error::LoadFailure;
pub use loader::{FactoryLoader, PluginLoader};
pub use serve::{serve, serve_stdio};
pub use session::WorkerSession;
