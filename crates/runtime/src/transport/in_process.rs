//! Workers hosted inside the current process.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use enclave_sandbox::{PluginLoader, SessionDispatcher, WorkerSession};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::channel::FrameChannel;
use super::{ConnectionEvents, Transport, WorkerRuntime};
use crate::registry::Endpoint;

struct Worker {
    session: Arc<WorkerSession>,
    cancel: CancellationToken,
    events: ConnectionEvents,
}

impl Worker {
    fn stop(&self) {
        self.cancel.cancel();
        self.session.shutdown();
    }
}

/// Actor-style transport: every bound endpoint gets its own
/// [`WorkerSession`] fed through a mailbox.
///
/// Endpoints are matched by `component` against the loaders registered with
/// [`register_worker`](Self::register_worker). Binding an unknown component
/// is refused.
pub struct InProcessTransport {
    runtime: WorkerRuntime,
    connect_latency: Duration,
    never_connect: bool,
    loaders: RwLock<HashMap<String, Arc<dyn PluginLoader>>>,
    workers: Mutex<HashMap<String, Worker>>,
    bind_calls: AtomicU64,
}

impl InProcessTransport {
    /// Transport with its own worker runtime.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self::with_runtime(WorkerRuntime::owned("enclave-worker")?))
    }

    /// Transport running workers on an existing runtime.
    ///
    /// Callers that block in `acquire` must not run on this runtime's
    /// threads.
    pub fn with_handle(handle: Handle) -> Self {
        Self::with_runtime(WorkerRuntime::borrowed(handle))
    }

    fn with_runtime(runtime: WorkerRuntime) -> Self {
        Self {
            runtime,
            connect_latency: Duration::ZERO,
            never_connect: false,
            loaders: RwLock::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            bind_calls: AtomicU64::new(0),
        }
    }

    /// Delay between a bind request and the connected event.
    #[must_use]
    pub fn with_connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    /// Accept binds but never report them as connected.
    #[must_use]
    pub fn never_connect(mut self) -> Self {
        self.never_connect = true;
        self
    }

    /// Serve endpoints whose component is `component` with `loader`.
    pub fn register_worker(&self, component: impl Into<String>, loader: Arc<dyn PluginLoader>) {
        self.loaders.write().insert(component.into(), loader);
    }

    /// Simulate the worker behind `component` dying.
    ///
    /// Returns `false` if nothing was bound there.
    pub fn kill(&self, component: &str) -> bool {
        let Some(worker) = self.workers.lock().remove(component) else {
            return false;
        };
        tracing::warn!(component, "killing in-process worker");
        worker.stop();
        worker.events.binding_died();
        true
    }

    /// Whether a worker is currently bound at `component`.
    pub fn is_bound(&self, component: &str) -> bool {
        self.workers.lock().contains_key(component)
    }

    /// Session of the worker bound at `component`.
    pub fn session(&self, component: &str) -> Option<Arc<WorkerSession>> {
        self.workers
            .lock()
            .get(component)
            .map(|worker| Arc::clone(&worker.session))
    }

    /// Bind requests received so far, refused ones included.
    pub fn bind_calls(&self) -> u64 {
        self.bind_calls.load(Ordering::Relaxed)
    }

    fn spawn_worker(&self, endpoint: &Endpoint, loader: Arc<dyn PluginLoader>, events: &ConnectionEvents) -> Worker {
        let handle = self.runtime.handle();
        let cancel = CancellationToken::new();
        let session = Arc::new(WorkerSession::new(loader, handle.clone()));

        let (host_tx, mut host_rx) = mpsc::unbounded_channel();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let dispatcher = SessionDispatcher::new(Arc::clone(&session), reply_tx);
        let channel = Arc::new(FrameChannel::new(endpoint.component.clone(), host_tx));

        let mailbox = cancel.clone();
        handle.spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    () = mailbox.cancelled() => break,
                    frame = host_rx.recv() => frame,
                };
                let Some(frame) = frame else { break };
                if dispatcher.dispatch(frame).is_break() {
                    break;
                }
            }
            dispatcher.session().shutdown();
        });

        let router = cancel.clone();
        let replies = Arc::clone(&channel);
        handle.spawn(async move {
            loop {
                let reply = tokio::select! {
                    biased;
                    () = router.cancelled() => break,
                    reply = reply_rx.recv() => reply,
                };
                let Some(reply) = reply else { break };
                replies.route(reply);
            }
            replies.close();
        });

        if !self.never_connect {
            let connect = cancel.clone();
            let latency = self.connect_latency;
            let events = events.clone();
            handle.spawn(async move {
                tokio::select! {
                    () = connect.cancelled() => {}
                    () = tokio::time::sleep(latency) => events.connected(channel),
                }
            });
        }

        Worker {
            session,
            cancel,
            events: events.clone(),
        }
    }
}

impl Transport for InProcessTransport {
    fn bind(&self, endpoint: &Endpoint, events: ConnectionEvents) -> bool {
        self.bind_calls.fetch_add(1, Ordering::Relaxed);

        let Some(loader) = self.loaders.read().get(&endpoint.component).cloned() else {
            tracing::warn!(component = %endpoint.component, "no in-process worker registered");
            return false;
        };

        let worker = self.spawn_worker(endpoint, loader, &events);
        let replaced = self.workers.lock().insert(endpoint.component.clone(), worker);
        if let Some(previous) = replaced {
            tracing::debug!(component = %endpoint.component, "replacing stale worker");
            previous.stop();
        }

        tracing::debug!(
            component = %endpoint.component,
            latency_ms = self.connect_latency.as_millis() as u64,
            "in-process worker started"
        );
        true
    }

    fn unbind(&self, endpoint: &Endpoint) {
        if let Some(worker) = self.workers.lock().remove(&endpoint.component) {
            tracing::debug!(component = %endpoint.component, "stopping in-process worker");
            worker.stop();
        }
    }
}

impl Drop for InProcessTransport {
    fn drop(&mut self) {
        for (_, worker) in self.workers.get_mut().drain() {
            worker.stop();
        }
    }
}

impl std::fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessTransport")
            .field("connect_latency", &self.connect_latency)
            .field("never_connect", &self.never_connect)
            .field("workers", &self.workers.lock().len())
            .finish_non_exhaustive()
    }
}
