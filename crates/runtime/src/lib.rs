#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Enclave Runtime
//!
//! Host side of the sandboxed worker protocol.
//!
//! This crate provides:
//! - [`PluginManager`] -- creates controllers from worker descriptors
//! - [`PluginController`] -- load / execute / render / unload / check_state
//! - [`WorkerBinder`] -- bounded, de-duplicated binding with crash recovery
//! - [`CallbackBridge`] -- resolve-once delivery of worker replies
//! - [`ConnectionResolver`] -- worker id to endpoint lookup
//! - [`InProcessTransport`] / [`ProcessTransport`] -- ways to reach a worker
//!
//! Every dispatched call completes exactly once on the caller's
//! [`ExecutionContext`], with a value or a typed [`PluginError`], even when
//! the worker dies mid-call.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use enclave_plugin::{Payload, WorkerDescriptor};
//! use enclave_runtime::{
//!     Endpoint, ExecutionContext, PluginManager, ProcessTransport, RuntimeConfig,
//! };
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = RuntimeConfig::default();
//! config.endpoints.push(Endpoint::new("w1", "/usr/libexec/enclave/worker"));
//!
//! let manager = PluginManager::from_config(config, Arc::new(ProcessTransport::new()?))?;
//! let controller = manager.create(WorkerDescriptor::builder("w1", "echo").build()?)?;
//!
//! let rt = tokio::runtime::Runtime::new()?;
//! let ctx = ExecutionContext::from_handle(rt.handle().clone());
//! controller.load("p1", &ctx).wait()?;
//! let output = controller
//!     .execute("p1", Payload::new().with("op", "x"), &ctx)
//!     .wait()?;
//! println!("{:?}", output.get_str("op"));
//! manager.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod binder;
pub mod bridge;
pub mod completion;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod manager;
pub mod registry;
pub mod resolver;
pub mod transport;

pub use binder::{BinderStats, ConnectionEvents, ConnectionState, WorkerBinder};
pub use bridge::{CallbackBridge, PendingRequestToken, RawCallback, RawReply, RawStateCallback, RequestKind};
pub use completion::Completion;
pub use config::{BinderConfig, DEFAULT_BIND_TIMEOUT_MS, RuntimeConfig};
pub use context::{CompletionExecutor, CompletionTask, ExecutionContext};
pub use controller::PluginController;
pub use error::{BindError, ConfigError, ManagerError, PluginError, ResolveError, TransportError};
pub use manager::PluginManager;
pub use registry::{Endpoint, Registry, StaticRegistry};
pub use resolver::{ConnectionResolver, ResolutionPolicy};
pub use transport::{InProcessTransport, LiveHandle, ProcessTransport, Transport, WorkerChannel};
