//! # Enclave Plugin
//!
//! The contract between vendor plugin code and the worker session that
//! hosts it.
//!
//! ## Core Types
//!
//! - [`Plugin`] - trait vendor code implements
//! - [`PluginContext`] - the only state a plugin instance may touch
//! - [`Payload`] / [`Value`] - typed key/value data, never executed
//! - [`PluginState`] / [`StateSnapshot`] - per-instance lifecycle
//! - [`Failure`] / [`FailureType`] - reserved failure codes
//! - [`WorkerDescriptor`] / [`PluginInfo`] - what to bind and what to load
//! - [`PluginCallback`] / [`StateCallback`] - single-use completions

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod callback;
mod descriptor;
mod error;
mod failure;
mod payload;
mod plugin;
mod state;

pub use callback::{PluginCallback, StateCallback};
pub use descriptor::{ArchiveInfo, PluginInfo, WorkerDescriptor, WorkerDescriptorBuilder};
pub use error::DescriptorError;
pub use failure::{Failure, FailureType};
pub use payload::{DEFAULT_MAX_PAYLOAD_BYTES, Payload, PayloadLimits, PayloadTooLarge, Value};
pub use plugin::{ExecuteRequest, Operation, Plugin, PluginContext};
pub use state::{PluginState, StateSnapshot};
