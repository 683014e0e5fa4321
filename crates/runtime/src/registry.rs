//! Endpoint registry for looking up workers by id.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A concrete, bindable worker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Logical worker id this endpoint serves.
    pub worker_id: String,
    /// Transport-specific component: an executable path for the process
    /// transport, a registered worker name for the in-process one.
    pub component: String,
}

impl Endpoint {
    /// Build an endpoint.
    pub fn new(worker_id: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            component: component.into(),
        }
    }
}

/// Source of endpoints for worker ids.
pub trait Registry: Send + Sync + 'static {
    /// Every endpoint registered for `worker_id`, in enumeration order.
    fn lookup(&self, worker_id: &str) -> Vec<Endpoint>;
}

/// Thread-safe in-memory registry.
///
/// Keeps registration order, which is the order [`Registry::lookup`]
/// enumerates matches in.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    endpoints: RwLock<Vec<Endpoint>>,
}

impl StaticRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with `endpoints`, typically from
    /// [`RuntimeConfig::endpoints`](crate::RuntimeConfig::endpoints).
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        Self {
            endpoints: RwLock::new(endpoints.into_iter().collect()),
        }
    }

    /// Register an endpoint. Exact duplicates are ignored.
    pub fn register(&self, endpoint: Endpoint) {
        let mut endpoints = self.endpoints.write();
        if endpoints.contains(&endpoint) {
            return;
        }
        tracing::info!(
            worker_id = %endpoint.worker_id,
            component = %endpoint.component,
            "registered worker endpoint"
        );
        endpoints.push(endpoint);
    }

    /// Remove an endpoint. Returns whether it was present.
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        let mut endpoints = self.endpoints.write();
        let before = endpoints.len();
        endpoints.retain(|e| e != endpoint);
        endpoints.len() != before
    }

    /// Number of registered endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}

impl Registry for StaticRegistry {
    fn lookup(&self, worker_id: &str) -> Vec<Endpoint> {
        self.endpoints
            .read()
            .iter()
            .filter(|e| e.worker_id == worker_id)
            .cloned()
            .collect()
    }
}
