//! Request/reply correlation over a frame stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use enclave_plugin::{ExecuteRequest, PluginCallback, PluginInfo, StateCallback};
use enclave_plugin_protocol::{HostFrame, RequestId, WorkerFrame};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::WorkerChannel;
use crate::error::TransportError;

enum Waiter {
    Reply(Box<dyn PluginCallback>),
    State(Box<dyn StateCallback>),
}

/// [`WorkerChannel`] that turns calls into [`HostFrame`]s and routes
/// [`WorkerFrame`] replies back to their callbacks by request id.
///
/// Once closed, queued and future calls have their callbacks dropped.
pub(crate) struct FrameChannel {
    component: String,
    outbound: mpsc::UnboundedSender<HostFrame>,
    next_id: AtomicU64,
    pending: Mutex<Option<HashMap<RequestId, Waiter>>>,
}

impl FrameChannel {
    pub(crate) fn new(component: impl Into<String>, outbound: mpsc::UnboundedSender<HostFrame>) -> Self {
        Self {
            component: component.into(),
            outbound,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(Some(HashMap::new())),
        }
    }

    fn send(&self, waiter: Waiter, frame: impl FnOnce(RequestId) -> HostFrame) -> Result<(), TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock();
            let Some(pending) = pending.as_mut() else {
                return Err(self.closed());
            };
            pending.insert(id, waiter);
        }

        if self.outbound.send(frame(id)).is_err() {
            self.take(id);
            return Err(self.closed());
        }
        Ok(())
    }

    /// Deliver a reply frame to its waiter.
    pub(crate) fn route(&self, frame: WorkerFrame) {
        let Some(id) = frame.id() else {
            tracing::debug!(component = %self.component, "ignoring repeated handshake");
            return;
        };
        let Some(waiter) = self.take(id) else {
            tracing::warn!(component = %self.component, id, "reply for unknown request");
            return;
        };

        match (frame, waiter) {
            (WorkerFrame::Success { output, .. }, Waiter::Reply(callback)) => callback.on_success(output),
            (WorkerFrame::Failure { failure, .. }, Waiter::Reply(callback)) => callback.on_failure(failure),
            (WorkerFrame::State { snapshot, .. }, Waiter::State(callback)) => callback.on_state(snapshot),
            (frame, _) => {
                tracing::warn!(component = %self.component, id, ?frame, "reply does not match the request");
            }
        }
    }

    /// Abandon one request that never reached the worker.
    ///
    /// Its callback is dropped unfired, which the bridge reports as a
    /// transport error.
    pub(crate) fn abandon(&self, id: RequestId, reason: &str) {
        if self.take(id).is_some() {
            tracing::warn!(component = %self.component, id, reason, "request abandoned");
        }
    }

    /// Refuse further calls and drop every outstanding callback.
    pub(crate) fn close(&self) -> usize {
        let drained = self.pending.lock().take();
        let count = drained.as_ref().map_or(0, HashMap::len);
        if count > 0 {
            tracing::debug!(component = %self.component, count, "dropping outstanding requests");
        }
        drop(drained);
        count
    }

    fn take(&self, id: RequestId) -> Option<Waiter> {
        self.pending.lock().as_mut().and_then(|pending| pending.remove(&id))
    }

    fn closed(&self) -> TransportError {
        TransportError::Closed {
            component: self.component.clone(),
        }
    }
}

impl WorkerChannel for FrameChannel {
    fn load(&self, info: PluginInfo, callback: Box<dyn PluginCallback>) -> Result<(), TransportError> {
        self.send(Waiter::Reply(callback), |id| HostFrame::Load { id, info })
    }

    fn execute(
        &self,
        plugin: &str,
        request: ExecuteRequest,
        callback: Box<dyn PluginCallback>,
    ) -> Result<(), TransportError> {
        self.send(Waiter::Reply(callback), |id| HostFrame::Execute {
            id,
            plugin: plugin.to_owned(),
            request,
        })
    }

    fn unload(&self, plugin: &str, callback: Box<dyn PluginCallback>) -> Result<(), TransportError> {
        self.send(Waiter::Reply(callback), |id| HostFrame::Unload {
            id,
            plugin: plugin.to_owned(),
        })
    }

    fn check_state(&self, plugin: &str, callback: Box<dyn StateCallback>) -> Result<(), TransportError> {
        self.send(Waiter::State(callback), |id| HostFrame::CheckState {
            id,
            plugin: plugin.to_owned(),
        })
    }
}
