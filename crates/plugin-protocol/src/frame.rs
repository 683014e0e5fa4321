//! Frame types.

use enclave_plugin::{ExecuteRequest, Failure, Payload, PluginInfo, StateSnapshot};
use serde::{Deserialize, Serialize};

/// Correlates a reply with the host frame that caused it.
pub type RequestId = u64;

/// Protocol revision announced in [`WorkerFrame::Ready`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    /// Instantiate a plugin under `info.name`.
    Load {
        /// Request id.
        id: RequestId,
        /// What to load.
        info: PluginInfo,
    },
    /// Run a loaded plugin.
    Execute {
        /// Request id.
        id: RequestId,
        /// Instance name.
        plugin: String,
        /// Operation and input.
        request: ExecuteRequest,
    },
    /// Release a plugin instance.
    Unload {
        /// Request id.
        id: RequestId,
        /// Instance name.
        plugin: String,
    },
    /// Query an instance's lifecycle state.
    CheckState {
        /// Request id.
        id: RequestId,
        /// Instance name.
        plugin: String,
    },
    /// Stop serving and exit.
    Shutdown,
}

impl HostFrame {
    /// Request id, if the frame expects a reply.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Self::Load { id, .. }
            | Self::Execute { id, .. }
            | Self::Unload { id, .. }
            | Self::CheckState { id, .. } => Some(*id),
            Self::Shutdown => None,
        }
    }
}

/// Worker to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// First frame the worker writes once it can accept requests.
    Ready {
        /// Protocol revision the worker speaks.
        protocol_version: u32,
    },
    /// A load, execute or unload call succeeded.
    Success {
        /// Request id.
        id: RequestId,
        /// Result; empty for load and unload.
        #[serde(default)]
        output: Payload,
    },
    /// A load, execute or unload call failed.
    Failure {
        /// Request id.
        id: RequestId,
        /// Failure code and detail.
        failure: Failure,
    },
    /// Answer to [`HostFrame::CheckState`].
    State {
        /// Request id.
        id: RequestId,
        /// Observed state.
        snapshot: StateSnapshot,
    },
}

impl WorkerFrame {
    /// Handshake frame for this protocol revision.
    pub fn ready() -> Self {
        Self::Ready {
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Request id, if the frame is a reply.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Self::Success { id, .. } | Self::Failure { id, .. } | Self::State { id, .. } => {
                Some(*id)
            }
            Self::Ready { .. } => None,
        }
    }
}
