//! How a binder reaches a worker.
//!
//! A [`Transport`] turns an [`Endpoint`] into a live [`WorkerChannel`],
//! reporting progress through [`ConnectionEvents`]. Two implementations
//! ship with the crate:
//!
//! - [`InProcessTransport`] runs each worker session on a dedicated tokio
//!   runtime inside the host process
//! - [`ProcessTransport`] spawns one child process per endpoint and speaks
//!   the line protocol over its stdin/stdout

mod channel;
mod in_process;
mod process;

use std::sync::Arc;

use enclave_plugin::{ExecuteRequest, PluginCallback, PluginInfo, StateCallback};
use tokio::runtime::{Builder, Handle, Runtime};

pub use crate::binder::ConnectionEvents;
use crate::error::TransportError;
use crate::registry::Endpoint;

pub use in_process::InProcessTransport;
pub use process::ProcessTransport;

/// Connection factory for worker endpoints.
pub trait Transport: Send + Sync + 'static {
    /// Start connecting to `endpoint`.
    ///
    /// Returns `false` if the bind cannot even be attempted. Otherwise the
    /// outcome arrives later through `events`, possibly before this call
    /// returns.
    fn bind(&self, endpoint: &Endpoint, events: ConnectionEvents) -> bool;

    /// Tear down whatever `bind` set up for `endpoint`. Must tolerate
    /// endpoints that are not bound.
    fn unbind(&self, endpoint: &Endpoint);
}

/// Live connection to one worker.
///
/// Every method returns promptly. On `Ok` the callback will be invoked
/// exactly once, or dropped if the connection dies. On `Err` the callback
/// has already been dropped.
pub trait WorkerChannel: Send + Sync + 'static {
    /// Load `info.name`.
    fn load(&self, info: PluginInfo, callback: Box<dyn PluginCallback>) -> Result<(), TransportError>;

    /// Execute or render through `plugin`.
    fn execute(
        &self,
        plugin: &str,
        request: ExecuteRequest,
        callback: Box<dyn PluginCallback>,
    ) -> Result<(), TransportError>;

    /// Unload `plugin`.
    fn unload(&self, plugin: &str, callback: Box<dyn PluginCallback>) -> Result<(), TransportError>;

    /// Query the state of `plugin`.
    fn check_state(&self, plugin: &str, callback: Box<dyn StateCallback>) -> Result<(), TransportError>;
}

/// Cached handle to a bound worker.
pub type LiveHandle = Arc<dyn WorkerChannel>;

/// Tokio runtime a transport drives its workers on, owned or borrowed.
pub(crate) struct WorkerRuntime {
    handle: Handle,
    owned: Option<Runtime>,
}

impl WorkerRuntime {
    pub(crate) fn owned(thread_name: &str) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(thread_name)
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            owned: Some(runtime),
        })
    }

    pub(crate) fn borrowed(handle: Handle) -> Self {
        Self {
            handle,
            owned: None,
        }
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which panics inside async code.
        if let Some(runtime) = self.owned.take() {
            runtime.shutdown_background();
        }
    }
}
