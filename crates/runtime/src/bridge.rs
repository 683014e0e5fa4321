//! Resolve-once bridge between raw worker callbacks and caller completions.
//!
//! Every dispatched call is registered as a [`PendingRequestToken`]. The
//! token leaves the registry the first time anything resolves it: a worker
//! callback, a dropped callback, or teardown. Later attempts are logged and
//! ignored, so the caller sees exactly one outcome.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use enclave_plugin::{
    Failure, FailureType, Payload, PayloadLimits, PluginCallback, StateCallback, StateSnapshot,
};
use parking_lot::Mutex;

use crate::context::ExecutionContext;
use crate::error::PluginError;

/// Operation a token was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Load a plugin.
    Load,
    /// Execute a plugin.
    Execute,
    /// Render through a plugin.
    Render,
    /// Unload a plugin.
    Unload,
    /// Query plugin state.
    CheckState,
}

impl RequestKind {
    /// Failure code reserved for this operation.
    pub fn failure_type(self) -> FailureType {
        match self {
            Self::Load => FailureType::LoadingPlugin,
            Self::Execute | Self::Render => FailureType::ExecutingPlugin,
            Self::Unload => FailureType::UnloadingPlugin,
            Self::CheckState => FailureType::Unknown,
        }
    }

    /// Error for a failure reported by the worker.
    ///
    /// The worker cannot choose the code: it always becomes the one reserved
    /// for this operation, so `ERROR_TRANSPORT` is only ever raised here.
    fn error_from(self, failure: Failure) -> PluginError {
        if failure.code != self.failure_type() {
            tracing::debug!(kind = %self, code = %failure.code, "rewriting worker failure code");
        }
        let failure = Failure {
            code: self.failure_type(),
            message: failure.message,
        };
        match self {
            Self::Load => PluginError::Load(failure),
            Self::Execute | Self::Render | Self::CheckState => PluginError::Execute(failure),
            Self::Unload => PluginError::Unload(failure),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Load => "load",
            Self::Execute => "execute",
            Self::Render => "render",
            Self::Unload => "unload",
            Self::CheckState => "check_state",
        })
    }
}

/// Handle for one in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingRequestToken {
    id: u64,
    kind: RequestKind,
}

impl PendingRequestToken {
    /// Bridge-unique id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Operation the token was issued for.
    #[inline]
    pub fn kind(&self) -> RequestKind {
        self.kind
    }
}

/// Successful raw reply from the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum RawReply {
    /// Load, execute, render or unload output.
    Output(Payload),
    /// State query answer.
    State(StateSnapshot),
}

impl RawReply {
    pub(crate) fn into_output(self) -> Result<Payload, PluginError> {
        match self {
            Self::Output(payload) => Ok(payload),
            Self::State(_) => Err(PluginError::transport("state reply to a plugin call")),
        }
    }

    pub(crate) fn into_state(self) -> Result<StateSnapshot, PluginError> {
        match self {
            Self::State(snapshot) => Ok(snapshot),
            Self::Output(_) => Err(PluginError::transport("plugin reply to a state query")),
        }
    }
}

/// Caller-side completion for a token.
pub type Deliver = Box<dyn FnOnce(Result<RawReply, PluginError>) + Send + 'static>;

struct Pending {
    kind: RequestKind,
    context: ExecutionContext,
    deliver: Deliver,
}

struct Shared {
    worker_id: String,
    limits: PayloadLimits,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
}

/// Registry of in-flight tokens for one binder.
#[derive(Clone)]
pub struct CallbackBridge {
    shared: Arc<Shared>,
}

impl CallbackBridge {
    /// Bridge for `worker_id`; outputs over `limits` fail.
    pub fn new(worker_id: impl Into<String>, limits: PayloadLimits) -> Self {
        Self {
            shared: Arc::new(Shared {
                worker_id: worker_id.into(),
                limits,
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a call. `deliver` runs on `context` exactly once.
    pub fn register(
        &self,
        kind: RequestKind,
        context: &ExecutionContext,
        deliver: impl FnOnce(Result<RawReply, PluginError>) + Send + 'static,
    ) -> PendingRequestToken {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.pending.lock().insert(
            id,
            Pending {
                kind,
                context: context.clone(),
                deliver: Box::new(deliver),
            },
        );
        tracing::trace!(worker_id = %self.shared.worker_id, token = id, %kind, "token registered");
        PendingRequestToken { id, kind }
    }

    /// Raw worker callback resolving `token`.
    ///
    /// Dropping it without firing resolves the token as a transport error.
    pub fn callback(&self, token: PendingRequestToken) -> RawCallback {
        RawCallback {
            bridge: Some(self.clone()),
            token,
        }
    }

    /// Raw state callback resolving `token`.
    pub fn state_callback(&self, token: PendingRequestToken) -> RawStateCallback {
        RawStateCallback {
            bridge: Some(self.clone()),
            token,
        }
    }

    /// Resolve `token`. Returns `false` if it was already resolved.
    pub fn complete(&self, token: PendingRequestToken, result: Result<RawReply, PluginError>) -> bool {
        let Some(pending) = self.shared.pending.lock().remove(&token.id) else {
            tracing::warn!(
                worker_id = %self.shared.worker_id,
                token = token.id,
                kind = %token.kind,
                "duplicate or late completion ignored"
            );
            return false;
        };

        let result = match result {
            Ok(RawReply::Output(output)) => match self.shared.limits.check(&output) {
                Ok(_) => Ok(RawReply::Output(output)),
                Err(e) => Err(PluginError::PayloadTooLarge(e)),
            },
            other => other,
        };

        self.deliver(token.id, pending, result);
        true
    }

    /// Resolve every pending token with `error`.
    pub fn fail_all(&self, error: &PluginError) -> usize {
        let drained: Vec<(u64, Pending)> = self.shared.pending.lock().drain().collect();
        let count = drained.len();
        if count > 0 {
            tracing::info!(
                worker_id = %self.shared.worker_id,
                count,
                error = %error,
                "failing pending requests"
            );
        }
        for (id, pending) in drained {
            self.deliver(id, pending, Err(error.clone()));
        }
        count
    }

    /// Resolve every pending token as connection lost.
    pub fn fail_all_connection_lost(&self) -> usize {
        self.fail_all(&PluginError::ConnectionLost {
            worker_id: self.shared.worker_id.clone(),
        })
    }

    /// Number of unresolved tokens.
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().len()
    }

    fn deliver(&self, id: u64, pending: Pending, result: Result<RawReply, PluginError>) {
        tracing::trace!(
            worker_id = %self.shared.worker_id,
            token = id,
            kind = %pending.kind,
            ok = result.is_ok(),
            "delivering completion"
        );
        let deliver = pending.deliver;
        pending.context.dispatch(move || deliver(result));
    }
}

impl fmt::Debug for CallbackBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackBridge")
            .field("worker_id", &self.shared.worker_id)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Worker-facing callback for one token.
pub struct RawCallback {
    bridge: Option<CallbackBridge>,
    token: PendingRequestToken,
}

impl PluginCallback for RawCallback {
    fn on_success(mut self: Box<Self>, output: Payload) {
        if let Some(bridge) = self.bridge.take() {
            bridge.complete(self.token, Ok(RawReply::Output(output)));
        }
    }

    fn on_failure(mut self: Box<Self>, failure: Failure) {
        if let Some(bridge) = self.bridge.take() {
            let error = self.token.kind.error_from(failure);
            bridge.complete(self.token, Err(error));
        }
    }
}

impl Drop for RawCallback {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.complete(
                self.token,
                Err(PluginError::transport("callback dropped without a reply")),
            );
        }
    }
}

/// Worker-facing state callback for one token.
pub struct RawStateCallback {
    bridge: Option<CallbackBridge>,
    token: PendingRequestToken,
}

impl StateCallback for RawStateCallback {
    fn on_state(mut self: Box<Self>, snapshot: StateSnapshot) {
        if let Some(bridge) = self.bridge.take() {
            bridge.complete(self.token, Ok(RawReply::State(snapshot)));
        }
    }
}

impl Drop for RawStateCallback {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.complete(
                self.token,
                Err(PluginError::transport("state query dropped without a reply")),
            );
        }
    }
}
