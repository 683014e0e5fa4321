//! Shared fixtures for the runtime integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use async_trait::async_trait;
use enclave_plugin::{
    ExecuteRequest, Failure, FailureType, Payload, Plugin, PluginContext, WorkerDescriptor,
};
use enclave_runtime::{
    BinderConfig, ConnectionEvents, Endpoint, ExecutionContext, InProcessTransport,
    PluginController, PluginManager, RuntimeConfig, StaticRegistry, Transport,
};
use enclave_sandbox::FactoryLoader;
use tokio::sync::Semaphore;

pub const WORKER: &str = "w1";
pub const COMPONENT: &str = "sandbox";

pub struct Echo;

#[async_trait]
impl Plugin for Echo {
    async fn execute(&self, request: ExecuteRequest, ctx: &PluginContext) -> Result<Payload, Failure> {
        Ok(request
            .input
            .with("plugin", ctx.plugin())
            .with("operation", request.operation.to_string()))
    }
}

/// Parks every call until the test adds a permit to `release`.
pub struct Hold {
    release: Arc<Semaphore>,
    started: mpsc::Sender<()>,
}

#[async_trait]
impl Plugin for Hold {
    async fn execute(&self, request: ExecuteRequest, _ctx: &PluginContext) -> Result<Payload, Failure> {
        let _ = self.started.send(());
        let permit = self
            .release
            .acquire()
            .await
            .map_err(|_| Failure::executing("release closed"))?;
        permit.forget();
        Ok(request.input)
    }
}

pub struct Panics;

#[async_trait]
impl Plugin for Panics {
    async fn execute(&self, _request: ExecuteRequest, _ctx: &PluginContext) -> Result<Payload, Failure> {
        panic!("vendor bug");
    }
}

/// Reports a transport failure from execute and panics in its unload hook.
pub struct Forges;

#[async_trait]
impl Plugin for Forges {
    async fn execute(&self, _request: ExecuteRequest, _ctx: &PluginContext) -> Result<Payload, Failure> {
        Err(Failure::new(FailureType::Transport).with_message("forged"))
    }

    fn on_unload(&self, _ctx: &PluginContext) -> Result<(), Failure> {
        panic!("vendor unload bug");
    }
}

/// Forwards to an inner transport and counts bind requests.
pub struct CountingTransport<T> {
    pub inner: T,
    binds: AtomicU64,
}

impl<T: Transport> CountingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            binds: AtomicU64::new(0),
        }
    }

    pub fn binds(&self) -> u64 {
        self.binds.load(Ordering::SeqCst)
    }
}

impl<T: Transport> Transport for CountingTransport<T> {
    fn bind(&self, endpoint: &Endpoint, events: ConnectionEvents) -> bool {
        self.binds.fetch_add(1, Ordering::SeqCst);
        self.inner.bind(endpoint, events)
    }

    fn unbind(&self, endpoint: &Endpoint) {
        self.inner.unbind(endpoint);
    }
}

/// In-process worker `w1` with `echo`, `hold`, `panic` and `forge` entry points.
pub struct Harness {
    pub transport: Arc<CountingTransport<InProcessTransport>>,
    pub registry: Arc<StaticRegistry>,
    pub manager: PluginManager,
    pub ctx: ExecutionContext,
    pub release: Arc<Semaphore>,
    pub started: mpsc::Receiver<()>,
    _callers: tokio::runtime::Runtime,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(InProcessTransport::new().unwrap(), 2_000)
    }

    pub fn with(transport: InProcessTransport, bind_timeout_ms: u64) -> Self {
        let _ = enclave_log::init_test();

        let release = Arc::new(Semaphore::new(0));
        let (started_tx, started) = mpsc::channel();
        let hold_release = Arc::clone(&release);
        let loader = FactoryLoader::new()
            .with_plugin("echo", || Echo)
            .with_plugin("panic", || Panics)
            .with_plugin("forge", || Forges)
            .with_plugin("hold", move || Hold {
                release: Arc::clone(&hold_release),
                started: started_tx.clone(),
            });
        transport.register_worker(COMPONENT, Arc::new(loader));
        let transport = Arc::new(CountingTransport::new(transport));

        let registry = Arc::new(StaticRegistry::new());
        registry.register(Endpoint::new(WORKER, COMPONENT));

        let config = RuntimeConfig {
            binder: BinderConfig {
                bind_timeout_ms,
                strict_resolution: false,
            },
            ..RuntimeConfig::default()
        };
        let manager = PluginManager::with_registry(
            registry.clone(),
            transport.clone(),
            config,
        )
        .unwrap();

        let callers = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let ctx = ExecutionContext::from_handle(callers.handle().clone());

        Self {
            transport,
            registry,
            manager,
            ctx,
            release,
            started,
            _callers: callers,
        }
    }

    pub fn controller(&self, entry_point: &str) -> PluginController {
        self.manager.create(descriptor(WORKER, entry_point)).unwrap()
    }

    /// Block until a `hold` call is running.
    pub fn wait_started(&self) {
        self.started
            .recv_timeout(Duration::from_secs(5))
            .expect("hold plugin never started");
    }
}

pub fn descriptor(worker_id: &str, entry_point: &str) -> WorkerDescriptor {
    WorkerDescriptor::builder(worker_id, entry_point).build().unwrap()
}
