//! Worker id to endpoint resolution.

use std::sync::Arc;

use enclave_plugin::WorkerDescriptor;

use crate::error::ResolveError;
use crate::registry::{Endpoint, Registry};

/// What to do when several endpoints match one worker id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolutionPolicy {
    /// Take the first match in registry order and log a warning.
    #[default]
    FirstMatch,
    /// Fail with [`ResolveError::Ambiguous`].
    Strict,
}

/// Stateless lookup of a bindable endpoint for a worker.
#[derive(Clone)]
pub struct ConnectionResolver {
    registry: Arc<dyn Registry>,
    policy: ResolutionPolicy,
}

impl ConnectionResolver {
    /// Resolver over `registry` with the first-match policy.
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            policy: ResolutionPolicy::default(),
        }
    }

    /// Change the ambiguity policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ResolutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Active policy.
    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    /// Resolve the endpoint for `descriptor`.
    pub fn resolve(&self, descriptor: &WorkerDescriptor) -> Result<Endpoint, ResolveError> {
        self.resolve_id(descriptor.worker_id())
    }

    /// Resolve the endpoint for a bare worker id.
    pub fn resolve_id(&self, worker_id: &str) -> Result<Endpoint, ResolveError> {
        let mut matches = self.registry.lookup(worker_id);
        let count = matches.len();

        if count == 0 {
            tracing::warn!(worker_id, "no endpoint registered for worker");
            return Err(ResolveError::NotFound {
                worker_id: worker_id.to_owned(),
            });
        }

        if count > 1 {
            if self.policy == ResolutionPolicy::Strict {
                return Err(ResolveError::Ambiguous {
                    worker_id: worker_id.to_owned(),
                    count,
                });
            }
            tracing::warn!(
                worker_id,
                count,
                chosen = %matches[0].component,
                "multiple endpoints match worker, using the first"
            );
        }

        Ok(matches.swap_remove(0))
    }
}

impl std::fmt::Debug for ConnectionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionResolver")
            .field("policy", &self.policy)
            .finish()
    }
}
