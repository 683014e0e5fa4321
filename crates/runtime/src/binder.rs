//! Connection lifecycle for one worker endpoint.
//!
//! ```text
//! Unbound --acquire--> Connecting --connected--> Bound
//!    ^                    |                        |
//!    |                    +--timeout/refused--> Failed
//!    +------ release / disconnected / binding died +
//! ```
//!
//! At most one bind attempt is in flight. Callers arriving while an attempt
//! is `Connecting` wait on the same [`Gate`] and observe the same outcome.
//! The state lock is never held across the transport's `bind` call or
//! across a wait, so transports may deliver events synchronously.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use enclave_plugin::WorkerDescriptor;
use parking_lot::{Condvar, Mutex};

use crate::bridge::CallbackBridge;
use crate::config::BinderConfig;
use crate::error::BindError;
use crate::registry::Endpoint;
use crate::resolver::ConnectionResolver;
use crate::transport::{LiveHandle, Transport};

/// Connection state of a [`WorkerBinder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and no attempt in flight.
    Unbound,
    /// A bind attempt is in flight.
    Connecting,
    /// A live handle is cached.
    Bound,
    /// The last attempt timed out, was refused or could not resolve.
    Failed,
}

/// Counters for one binder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinderStats {
    /// Bind requests issued to the transport.
    pub bind_attempts: u64,
    /// Successful handshakes.
    pub connects: u64,
    /// Connections lost after or during the handshake.
    pub disconnects: u64,
    /// Attempts abandoned on timeout.
    pub timeouts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Connected,
    Timeout,
    Refused,
    Disconnected,
}

/// Release-once notification shared by every waiter of one attempt.
#[derive(Debug, Default)]
struct Gate {
    outcome: Mutex<Option<Outcome>>,
    cv: Condvar,
}

impl Gate {
    fn release(&self, outcome: Outcome) -> bool {
        let mut slot = self.outcome.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.cv.notify_all();
        true
    }

    fn wait(&self, timeout: Duration) -> Option<Outcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.outcome.lock();
        while slot.is_none() {
            if self.cv.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        *slot
    }

    fn outcome(&self) -> Option<Outcome> {
        *self.outcome.lock()
    }
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    endpoint: Option<Endpoint>,
    handle: Option<LiveHandle>,
    gate: Option<Arc<Gate>>,
}

#[derive(Default)]
struct Counters {
    bind_attempts: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
    timeouts: AtomicU64,
}

struct Shared {
    descriptor: Arc<WorkerDescriptor>,
    resolver: ConnectionResolver,
    transport: Arc<dyn Transport>,
    bridge: CallbackBridge,
    config: BinderConfig,
    inner: Mutex<Inner>,
    counters: Counters,
}

enum Begun {
    Bound(LiveHandle),
    Waiting { gate: Arc<Gate>, generation: u64 },
}

/// Owns the connection to one worker endpoint.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct WorkerBinder {
    shared: Arc<Shared>,
}

impl WorkerBinder {
    /// Binder for `descriptor`. Nothing is bound until
    /// [`acquire`](Self::acquire) or [`begin_bind`](Self::begin_bind).
    pub fn new(
        descriptor: Arc<WorkerDescriptor>,
        resolver: ConnectionResolver,
        transport: Arc<dyn Transport>,
        bridge: CallbackBridge,
        config: BinderConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                descriptor,
                resolver,
                transport,
                bridge,
                config,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Unbound,
                    generation: 0,
                    endpoint: None,
                    handle: None,
                    gate: None,
                }),
                counters: Counters::default(),
            }),
        }
    }

    pub(crate) fn same_binder(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Worker id this binder connects to.
    pub fn worker_id(&self) -> &str {
        self.shared.descriptor.worker_id()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Endpoint of the current or in-flight connection.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.shared.inner.lock().endpoint.clone()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BinderStats {
        let c = &self.shared.counters;
        BinderStats {
            bind_attempts: c.bind_attempts.load(Ordering::Relaxed),
            connects: c.connects.load(Ordering::Relaxed),
            disconnects: c.disconnects.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Get the live handle, binding first if needed.
    ///
    /// Returns immediately when bound. Otherwise blocks the calling thread
    /// for at most the configured bind timeout. Must not be called from a
    /// thread that drives the transport's events.
    pub fn acquire(&self) -> Result<LiveHandle, BindError> {
        let (gate, generation) = match self.begin()? {
            Begun::Bound(handle) => return Ok(handle),
            Begun::Waiting { gate, generation } => (gate, generation),
        };

        let timeout = self.shared.config.bind_timeout();
        let outcome = match gate.wait(timeout) {
            Some(outcome) => outcome,
            None => {
                self.shared.abandon(generation, Outcome::Timeout);
                gate.outcome().unwrap_or(Outcome::Timeout)
            }
        };

        self.finish(outcome, generation)
    }

    /// Resolve and issue the bind without waiting for the handshake.
    ///
    /// A no-op when already bound or connecting. Fails when the worker
    /// cannot be resolved or the transport refuses the bind.
    pub fn begin_bind(&self) -> Result<(), BindError> {
        self.begin().map(|_| ())
    }

    /// Tear the connection down.
    ///
    /// Idempotent and valid from any state. Unbinds the transport, fails
    /// every pending request as connection lost and releases any waiters.
    pub fn release(&self) {
        let (endpoint, gate) = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            inner.state = ConnectionState::Unbound;
            inner.handle = None;
            (inner.endpoint.take(), inner.gate.take())
        };

        if let Some(gate) = gate {
            gate.release(Outcome::Disconnected);
        }
        self.shared.bridge.fail_all_connection_lost();
        if let Some(endpoint) = &endpoint {
            tracing::info!(
                worker_id = %self.worker_id(),
                component = %endpoint.component,
                "releasing worker binding"
            );
            self.shared.transport.unbind(endpoint);
        }
    }

    fn begin(&self) -> Result<Begun, BindError> {
        let shared = &self.shared;
        let (endpoint, gate, generation) = {
            let mut inner = shared.inner.lock();

            if inner.state == ConnectionState::Bound
                && let Some(handle) = &inner.handle
            {
                return Ok(Begun::Bound(Arc::clone(handle)));
            }
            if inner.state == ConnectionState::Connecting
                && let Some(gate) = &inner.gate
            {
                return Ok(Begun::Waiting {
                    gate: Arc::clone(gate),
                    generation: inner.generation,
                });
            }

            let endpoint = match shared.resolver.resolve(&shared.descriptor) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    inner.state = ConnectionState::Failed;
                    return Err(BindError::Resolution(e));
                }
            };

            let gate = Arc::new(Gate::default());
            inner.generation += 1;
            inner.state = ConnectionState::Connecting;
            inner.endpoint = Some(endpoint.clone());
            inner.handle = None;
            inner.gate = Some(Arc::clone(&gate));
            (endpoint, gate, inner.generation)
        };

        shared.counters.bind_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            worker_id = %self.worker_id(),
            component = %endpoint.component,
            generation,
            "binding worker"
        );

        let events = ConnectionEvents {
            binder: Arc::downgrade(shared),
            generation,
        };
        if !shared.transport.bind(&endpoint, events) {
            tracing::warn!(
                worker_id = %self.worker_id(),
                component = %endpoint.component,
                "transport refused bind"
            );
            shared.abandon(generation, Outcome::Refused);
            return Err(BindError::Failed {
                worker_id: self.worker_id().to_owned(),
                reason: "transport refused the bind".into(),
            });
        }

        Ok(Begun::Waiting { gate, generation })
    }

    fn finish(&self, outcome: Outcome, generation: u64) -> Result<LiveHandle, BindError> {
        let worker_id = self.worker_id().to_owned();
        match outcome {
            Outcome::Connected => {
                let inner = self.shared.inner.lock();
                match (&inner.handle, inner.state, inner.generation == generation) {
                    (Some(handle), ConnectionState::Bound, true) => Ok(Arc::clone(handle)),
                    _ => Err(BindError::Failed {
                        worker_id,
                        reason: "connection lost before the handle was handed out".into(),
                    }),
                }
            }
            Outcome::Timeout => Err(BindError::Timeout {
                worker_id,
                timeout_ms: self.shared.config.bind_timeout_ms,
            }),
            Outcome::Refused => Err(BindError::Failed {
                worker_id,
                reason: "endpoint refused the binding".into(),
            }),
            Outcome::Disconnected => Err(BindError::Failed {
                worker_id,
                reason: "worker disconnected during the handshake".into(),
            }),
        }
    }
}

impl Shared {
    fn worker_id(&self) -> &str {
        self.descriptor.worker_id()
    }

    /// Give up on attempt `generation`: `Failed`, gate released, transport unbound.
    fn abandon(&self, generation: u64, outcome: Outcome) {
        let (endpoint, gate) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connecting {
                return;
            }
            inner.state = ConnectionState::Failed;
            inner.handle = None;
            (inner.endpoint.take(), inner.gate.take())
        };

        if outcome == Outcome::Timeout {
            self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                worker_id = %self.worker_id(),
                timeout_ms = self.config.bind_timeout_ms,
                "bind timed out"
            );
        }
        if let Some(gate) = gate {
            gate.release(outcome);
        }
        if let Some(endpoint) = endpoint {
            self.transport.unbind(&endpoint);
        }
    }

    fn on_connected(&self, generation: u64, handle: LiveHandle) {
        let gate = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != ConnectionState::Connecting {
                tracing::debug!(
                    worker_id = %self.worker_id(),
                    generation,
                    "ignoring stale connect"
                );
                return;
            }
            inner.state = ConnectionState::Bound;
            inner.handle = Some(handle);
            inner.gate.take()
        };

        self.counters.connects.fetch_add(1, Ordering::Relaxed);
        tracing::info!(worker_id = %self.worker_id(), generation, "worker connected");
        if let Some(gate) = gate {
            gate.release(Outcome::Connected);
        }
    }

    fn on_lost(&self, generation: u64, outcome: Outcome, cause: &'static str) {
        let (endpoint, gate) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation
                || !matches!(
                    inner.state,
                    ConnectionState::Connecting | ConnectionState::Bound
                )
            {
                tracing::debug!(worker_id = %self.worker_id(), generation, cause, "ignoring stale event");
                return;
            }
            inner.generation += 1;
            inner.state = ConnectionState::Unbound;
            inner.handle = None;
            (inner.endpoint.take(), inner.gate.take())
        };

        self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(worker_id = %self.worker_id(), cause, "worker connection lost");
        if let Some(gate) = gate {
            gate.release(outcome);
        }
        self.bridge.fail_all_connection_lost();
        if let Some(endpoint) = endpoint {
            self.transport.unbind(&endpoint);
        }
    }
}

impl std::fmt::Debug for WorkerBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerBinder")
            .field("worker_id", &self.worker_id())
            .field("state", &self.state())
            .finish()
    }
}

/// Event sink handed to [`Transport::bind`].
///
/// Any thread may post events. Events from an attempt that has since been
/// released, timed out or replaced are ignored.
#[derive(Clone)]
pub struct ConnectionEvents {
    binder: Weak<Shared>,
    generation: u64,
}

impl ConnectionEvents {
    /// The worker is ready; `handle` becomes the binder's live handle.
    pub fn connected(&self, handle: LiveHandle) {
        if let Some(shared) = self.binder.upgrade() {
            shared.on_connected(self.generation, handle);
        }
    }

    /// The connection dropped.
    pub fn disconnected(&self) {
        if let Some(shared) = self.binder.upgrade() {
            shared.on_lost(self.generation, Outcome::Disconnected, "disconnected");
        }
    }

    /// The worker process died.
    pub fn binding_died(&self) {
        if let Some(shared) = self.binder.upgrade() {
            shared.on_lost(self.generation, Outcome::Disconnected, "binding died");
        }
    }

    /// The endpoint accepted the bind but will never provide a handle.
    pub fn null_binding(&self) {
        if let Some(shared) = self.binder.upgrade() {
            shared.on_lost(self.generation, Outcome::Refused, "null binding");
        }
    }

    /// Attempt this sink belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for ConnectionEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEvents")
            .field("generation", &self.generation)
            .field("live", &(self.binder.strong_count() > 0))
            .finish()
    }
}
