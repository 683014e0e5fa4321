//! Entry point: descriptors in, controllers out.

use std::collections::HashMap;
use std::sync::Arc;

use enclave_plugin::WorkerDescriptor;
use parking_lot::Mutex;

use crate::binder::WorkerBinder;
use crate::bridge::CallbackBridge;
use crate::config::RuntimeConfig;
use crate::controller::PluginController;
use crate::error::{ConfigError, ManagerError};
use crate::registry::{Registry, StaticRegistry};
use crate::resolver::ConnectionResolver;
use crate::transport::Transport;

#[derive(Clone)]
struct Binding {
    binder: WorkerBinder,
    bridge: CallbackBridge,
}

/// Creates [`PluginController`]s and owns their bindings.
///
/// Built explicitly by the application and shut down explicitly. One
/// binding exists per worker id; controllers for the same worker share it.
pub struct PluginManager {
    resolver: ConnectionResolver,
    transport: Arc<dyn Transport>,
    config: RuntimeConfig,
    bindings: Mutex<HashMap<String, Binding>>,
}

impl PluginManager {
    /// Manager over an existing resolver.
    pub fn new(
        resolver: ConnectionResolver,
        transport: Arc<dyn Transport>,
        config: RuntimeConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            resolver,
            transport,
            config,
            bindings: Mutex::new(HashMap::new()),
        })
    }

    /// Manager resolving through `registry` with the configured policy.
    pub fn with_registry(
        registry: Arc<dyn Registry>,
        transport: Arc<dyn Transport>,
        config: RuntimeConfig,
    ) -> Result<Self, ConfigError> {
        let resolver =
            ConnectionResolver::new(registry).with_policy(config.binder.resolution_policy());
        Self::new(resolver, transport, config)
    }

    /// Manager resolving through the endpoints listed in `config`.
    pub fn from_config(config: RuntimeConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        let registry = StaticRegistry::from_endpoints(config.endpoints.iter().cloned());
        Self::with_registry(Arc::new(registry), transport, config)
    }

    /// Active configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Controller for `descriptor`.
    ///
    /// Resolves the worker and starts binding right away, without waiting
    /// for the handshake. Fails if the worker cannot be resolved or the
    /// transport refuses the bind.
    pub fn create(&self, descriptor: WorkerDescriptor) -> Result<PluginController, ManagerError> {
        let descriptor = Arc::new(descriptor);
        let worker_id = descriptor.worker_id().to_owned();

        let (binding, created) = {
            let mut bindings = self.bindings.lock();
            match bindings.get(&worker_id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let bridge = CallbackBridge::new(worker_id.clone(), self.config.payload);
                    let binder = WorkerBinder::new(
                        Arc::clone(&descriptor),
                        self.resolver.clone(),
                        Arc::clone(&self.transport),
                        bridge.clone(),
                        self.config.binder.clone(),
                    );
                    let binding = Binding { binder, bridge };
                    bindings.insert(worker_id.clone(), binding.clone());
                    (binding, true)
                }
            }
        };

        if let Err(source) = binding.binder.begin_bind() {
            tracing::warn!(worker_id = %worker_id, error = %source, "cannot create controller");
            if created {
                self.forget(&worker_id, &binding);
            }
            return Err(ManagerError::ServiceNotFound { worker_id, source });
        }

        tracing::info!(
            worker_id = %worker_id,
            entry_point = %descriptor.entry_point(),
            "plugin controller created"
        );
        Ok(PluginController::new(
            binding.binder,
            binding.bridge,
            descriptor,
            self.config.payload,
        ))
    }

    /// Drop the binding for `worker_id` if it is still `binding`.
    fn forget(&self, worker_id: &str, binding: &Binding) {
        let mut bindings = self.bindings.lock();
        if bindings
            .get(worker_id)
            .is_some_and(|current| current.binder.same_binder(&binding.binder))
        {
            bindings.remove(worker_id);
        }
    }

    /// Binder for `worker_id`, if a controller was created for it.
    pub fn binder(&self, worker_id: &str) -> Option<WorkerBinder> {
        self.bindings
            .lock()
            .get(worker_id)
            .map(|binding| binding.binder.clone())
    }

    /// Release every binding. Calls in flight fail as connection lost.
    pub fn shutdown(&self) {
        let bindings: Vec<Binding> = self.bindings.lock().drain().map(|(_, b)| b).collect();
        tracing::info!(count = bindings.len(), "plugin manager shutting down");
        for binding in bindings {
            binding.binder.release();
        }
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("resolver", &self.resolver)
            .field("bindings", &self.bindings.lock().len())
            .finish_non_exhaustive()
    }
}
