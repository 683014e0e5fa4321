//! Per-process plugin executor.
//!
//! A [`WorkerSession`] owns every plugin instance loaded into the isolated
//! process and enforces the per-instance state machine:
//!
//! ```text
//! NotLoaded --load--> Loaded --execute--> Executing --done--> Loaded
//!                       |                    |
//!                       |                    +--panic--> Exception
//!                       +--unload--> Unloaded
//! ```
//!
//! Every operation completes through its callback exactly once. Calls that
//! are invalid in the current state are reported as failures, never queued.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use enclave_plugin::{
    ExecuteRequest, Failure, FailureType, Payload, Plugin, PluginCallback, PluginContext,
    PluginInfo, PluginState, StateCallback, StateSnapshot,
};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::panic_message;
use crate::loader::PluginLoader;

#[derive(Clone)]
struct Instance {
    plugin: Arc<dyn Plugin>,
    ctx: Arc<PluginContext>,
}

struct Slot {
    state: PluginState,
    generation: u64,
    instance: Option<Instance>,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

/// Dispatcher for the plugins of one isolated worker process.
pub struct WorkerSession {
    loader: Arc<dyn PluginLoader>,
    slots: Slots,
    next_generation: Mutex<u64>,
    handle: Handle,
    cancel: CancellationToken,
}

impl WorkerSession {
    /// Session whose executions run on `handle`.
    pub fn new(loader: Arc<dyn PluginLoader>, handle: Handle) -> Self {
        Self {
            loader,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Mutex::new(0),
            handle,
            cancel: CancellationToken::new(),
        }
    }

    /// Instantiate `info.entry_point` under `info.name`.
    ///
    /// Replaces any previous instance with the same name unless it is
    /// currently executing.
    pub fn load(&self, info: PluginInfo, callback: Box<dyn PluginCallback>) {
        let name = info.name.clone();

        if self.state(&name) == PluginState::Executing {
            tracing::warn!(plugin = %name, "load rejected: plugin is executing");
            callback.on_failure(Failure::loading(format!("plugin '{name}' is executing")));
            return;
        }

        let plugin = match self.loader.load(&info) {
            Ok(plugin) => plugin,
            Err(e) => {
                tracing::warn!(plugin = %name, entry_point = %info.entry_point, error = %e, "load failed");
                callback.on_failure(e.to_failure());
                return;
            }
        };

        let generation = {
            let mut next = self.next_generation.lock();
            *next += 1;
            *next
        };
        let instance = Instance {
            plugin,
            ctx: Arc::new(PluginContext::new(name.clone(), info.init_data)),
        };

        let installed = {
            let mut slots = self.slots.lock();
            let busy = slots
                .get(&name)
                .is_some_and(|slot| slot.state == PluginState::Executing);
            if !busy {
                slots.insert(
                    name.clone(),
                    Slot {
                        state: PluginState::Loaded,
                        generation,
                        instance: Some(instance),
                    },
                );
            }
            !busy
        };

        if installed {
            tracing::info!(plugin = %name, entry_point = %info.entry_point, "plugin loaded");
            callback.on_success(Payload::new());
        } else {
            callback.on_failure(Failure::loading(format!("plugin '{name}' is executing")));
        }
    }

    /// Run `request` against the instance `plugin`.
    ///
    /// Only valid from `Loaded`. The plugin runs on the session runtime; the
    /// callback fires after the state has been updated.
    pub fn execute(&self, plugin: &str, request: ExecuteRequest, callback: Box<dyn PluginCallback>) {
        let claimed = {
            let mut slots = self.slots.lock();
            match slots.get_mut(plugin) {
                Some(slot) if slot.state.can_execute() => match slot.instance.clone() {
                    Some(instance) => {
                        slot.state = PluginState::Executing;
                        Ok((instance, slot.generation))
                    }
                    None => Err(PluginState::NotLoaded),
                },
                Some(slot) => Err(slot.state),
                None => Err(PluginState::NotLoaded),
            }
        };

        let (instance, generation) = match claimed {
            Ok(claimed) => claimed,
            Err(state) => {
                tracing::debug!(plugin, %state, "execute rejected");
                let reason = if state == PluginState::NotLoaded {
                    "not loaded".to_owned()
                } else {
                    state.to_string()
                };
                callback.on_failure(Failure::executing(format!("plugin '{plugin}' is {reason}")));
                return;
            }
        };

        let name = plugin.to_owned();
        let slots = Arc::clone(&self.slots);
        let cancel = self.cancel.clone();
        let operation = request.operation;

        self.handle.spawn(async move {
            let run = AssertUnwindSafe(instance.plugin.execute(request, &instance.ctx)).catch_unwind();

            let outcome = tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(plugin = %name, "execution cancelled by shutdown");
                    return;
                }
                outcome = run => outcome,
            };

            let (next, result) = match outcome {
                Ok(result) => (
                    PluginState::Loaded,
                    result.map_err(|failure| Failure {
                        code: FailureType::ExecutingPlugin,
                        message: failure.message,
                    }),
                ),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(plugin = %name, %message, "plugin panicked during execute");
                    (PluginState::Exception, Err(Failure::executing(message)))
                }
            };

            {
                let mut slots = slots.lock();
                if let Some(slot) = slots.get_mut(&name)
                    && slot.generation == generation
                    && slot.state == PluginState::Executing
                {
                    slot.state = next;
                }
            }

            match result {
                Ok(output) => {
                    tracing::debug!(plugin = %name, %operation, "execute succeeded");
                    callback.on_success(output);
                }
                Err(failure) => {
                    tracing::debug!(plugin = %name, %operation, code = %failure.code, "execute failed");
                    callback.on_failure(failure);
                }
            }
        });
    }

    /// Release the instance `plugin`.
    ///
    /// Valid from `Loaded` or `Exception`. If the unload hook returns a
    /// failure the previous state is kept; if it panics the plugin moves to
    /// `Exception`.
    pub fn unload(&self, plugin: &str, callback: Box<dyn PluginCallback>) {
        let claimed = {
            let mut slots = self.slots.lock();
            match slots.get_mut(plugin) {
                Some(slot) if slot.state.can_unload() => {
                    let previous = slot.state;
                    slot.state = PluginState::Unloaded;
                    Ok((slot.instance.clone(), slot.generation, previous))
                }
                Some(slot) => Err(slot.state),
                None => Err(PluginState::NotLoaded),
            }
        };

        let (instance, generation, previous) = match claimed {
            Ok(claimed) => claimed,
            Err(state) => {
                tracing::debug!(plugin, %state, "unload rejected");
                callback.on_failure(Failure::unloading(format!("plugin '{plugin}' is {state}")));
                return;
            }
        };

        let hook = instance.as_ref().map_or(Ok(Ok(())), |i| {
            catch_unwind(AssertUnwindSafe(|| i.plugin.on_unload(&i.ctx)))
        });
        let (next, failure) = match hook {
            Ok(Ok(())) => (PluginState::Unloaded, None),
            Ok(Err(failure)) => (
                previous,
                Some(Failure {
                    code: FailureType::UnloadingPlugin,
                    message: failure.message,
                }),
            ),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(plugin, %message, "plugin panicked during unload");
                (PluginState::Exception, Some(Failure::unloading(message)))
            }
        };

        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(plugin)
                && slot.generation == generation
                && slot.state == PluginState::Unloaded
            {
                slot.state = next;
                if next == PluginState::Unloaded {
                    slot.instance = None;
                }
            }
        }

        match failure {
            None => {
                tracing::info!(plugin, "plugin unloaded");
                callback.on_success(Payload::new());
            }
            Some(failure) => {
                tracing::warn!(plugin, %failure, "unload hook failed");
                callback.on_failure(failure);
            }
        }
    }

    /// Report the state of `plugin`. Never waits on a running execution.
    pub fn check_state(&self, plugin: &str, callback: Box<dyn StateCallback>) {
        let state = self.state(plugin);
        callback.on_state(StateSnapshot::new(plugin, state));
    }

    /// Current state of `plugin`; `NotLoaded` for unknown names.
    pub fn state(&self, plugin: &str) -> PluginState {
        self.slots
            .lock()
            .get(plugin)
            .map_or(PluginState::NotLoaded, |slot| slot.state)
    }

    /// Cancel every in-flight execution. Their callbacks are dropped
    /// without firing.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("worker session shutting down");
            self.cancel.cancel();
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSession")
            .field("plugins", &self.slots.lock().len())
            .field("shut_down", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use enclave_plugin::{Operation, Value};
    use pretty_assertions::assert_eq;
    use tokio::sync::{Notify, oneshot};

    use super::*;
    use crate::FactoryLoader;

    struct Echo;

    #[async_trait]
    impl Plugin for Echo {
        async fn execute(
            &self,
            request: ExecuteRequest,
            ctx: &PluginContext,
        ) -> Result<Payload, Failure> {
            Ok(request
                .input
                .with("plugin", ctx.plugin())
                .with("operation", request.operation.to_string()))
        }
    }

    struct Gate(Arc<Notify>);

    #[async_trait]
    impl Plugin for Gate {
        async fn execute(&self, _: ExecuteRequest, _: &PluginContext) -> Result<Payload, Failure> {
            self.0.notified().await;
            Ok(Payload::new())
        }
    }

    struct Boom;

    #[async_trait]
    impl Plugin for Boom {
        async fn execute(&self, _: ExecuteRequest, _: &PluginContext) -> Result<Payload, Failure> {
            panic!("vendor bug")
        }
    }

    struct Refuses;

    #[async_trait]
    impl Plugin for Refuses {
        async fn execute(&self, _: ExecuteRequest, _: &PluginContext) -> Result<Payload, Failure> {
            Err(Failure::new(FailureType::Unknown).with_message("bad input"))
        }

        fn on_unload(&self, _: &PluginContext) -> Result<(), Failure> {
            Err(Failure::new(FailureType::Unknown).with_message("still busy"))
        }
    }

    struct Forges;

    #[async_trait]
    impl Plugin for Forges {
        async fn execute(&self, _: ExecuteRequest, _: &PluginContext) -> Result<Payload, Failure> {
            Err(Failure::new(FailureType::Transport).with_message("forged"))
        }

        fn on_unload(&self, _: &PluginContext) -> Result<(), Failure> {
            panic!("vendor unload bug")
        }
    }

    fn session(notify: Arc<Notify>) -> WorkerSession {
        let loader = FactoryLoader::new()
            .with_plugin("echo", || Echo)
            .with_plugin("forges", || Forges)
            .with_plugin("boom", || Boom)
            .with_plugin("refuses", || Refuses)
            .with_plugin("gate", move || Gate(Arc::clone(&notify)));
        WorkerSession::new(Arc::new(loader), Handle::current())
    }

    fn info(name: &str, entry_point: &str) -> PluginInfo {
        PluginInfo {
            name: name.into(),
            entry_point: entry_point.into(),
            archives: Vec::new(),
            init_data: Payload::new(),
        }
    }

    fn reply() -> (Box<dyn PluginCallback>, oneshot::Receiver<Result<Payload, Failure>>) {
        let (tx, rx) = oneshot::channel();
        let callback = move |result: Result<Payload, Failure>| {
            let _ = tx.send(result);
        };
        (Box::new(callback), rx)
    }

    async fn load(session: &WorkerSession, name: &str, entry_point: &str) {
        let (cb, rx) = reply();
        session.load(info(name, entry_point), cb);
        rx.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn load_then_execute_echoes_input() {
        let session = session(Arc::new(Notify::new()));
        load(&session, "p1", "echo").await;
        assert_eq!(session.state("p1"), PluginState::Loaded);

        let (cb, rx) = reply();
        session.execute(
            "p1",
            ExecuteRequest::execute(Payload::new().with("op", "x")),
            cb,
        );
        let out = rx.await.unwrap().unwrap();

        assert_eq!(out.get_str("op"), Some("x"));
        assert_eq!(out.get_str("plugin"), Some("p1"));
        assert_eq!(session.state("p1"), PluginState::Loaded);
    }

    #[tokio::test]
    async fn render_is_tagged() {
        let session = session(Arc::new(Notify::new()));
        load(&session, "p1", "echo").await;

        let (cb, rx) = reply();
        session.execute("p1", ExecuteRequest::render(Payload::new()), cb);
        let out = rx.await.unwrap().unwrap();

        assert_eq!(
            out.get("operation"),
            Some(&Value::from(Operation::Render.to_string()))
        );
    }

    #[tokio::test]
    async fn execute_unknown_plugin_fails_without_side_effects() {
        let session = session(Arc::new(Notify::new()));

        let (cb, rx) = reply();
        session.execute("ghost", ExecuteRequest::default(), cb);
        let failure = rx.await.unwrap().unwrap_err();

        assert_eq!(failure.code, FailureType::ExecutingPlugin);
        assert_eq!(session.state("ghost"), PluginState::NotLoaded);
    }

    #[tokio::test]
    async fn execute_while_executing_is_rejected() {
        let notify = Arc::new(Notify::new());
        let session = session(Arc::clone(&notify));
        load(&session, "g", "gate").await;

        let (first, first_rx) = reply();
        session.execute("g", ExecuteRequest::default(), first);
        assert_eq!(session.state("g"), PluginState::Executing);

        let (second, second_rx) = reply();
        session.execute("g", ExecuteRequest::default(), second);
        let rejected = second_rx.await.unwrap().unwrap_err();
        assert_eq!(rejected.code, FailureType::ExecutingPlugin);

        let (cb, rx) = reply();
        session.load(info("g", "echo"), cb);
        assert_eq!(
            rx.await.unwrap().unwrap_err().code,
            FailureType::LoadingPlugin
        );

        notify.notify_one();
        first_rx.await.unwrap().unwrap();
        assert_eq!(session.state("g"), PluginState::Loaded);
    }

    #[tokio::test]
    async fn panic_moves_instance_to_exception_until_reload() {
        let session = session(Arc::new(Notify::new()));
        load(&session, "b", "boom").await;

        let (cb, rx) = reply();
        session.execute("b", ExecuteRequest::default(), cb);
        let failure = rx.await.unwrap().unwrap_err();
        assert_eq!(failure.code, FailureType::ExecutingPlugin);
        assert_eq!(session.state("b"), PluginState::Exception);

        let (cb, rx) = reply();
        session.execute("b", ExecuteRequest::default(), cb);
        assert!(rx.await.unwrap().is_err());

        load(&session, "b", "echo").await;
        assert_eq!(session.state("b"), PluginState::Loaded);
    }

    #[tokio::test]
    async fn returned_failure_is_forwarded_and_instance_stays_loaded() {
        let session = session(Arc::new(Notify::new()));
        load(&session, "r", "refuses").await;

        let (cb, rx) = reply();
        session.execute("r", ExecuteRequest::default(), cb);
        let failure = rx.await.unwrap().unwrap_err();

        assert_eq!(failure.code, FailureType::ExecutingPlugin);
        assert_eq!(failure.message.as_deref(), Some("bad input"));
        assert_eq!(session.state("r"), PluginState::Loaded);
    }

    #[tokio::test]
    async fn unload_hook_failure_keeps_state() {
        let session = session(Arc::new(Notify::new()));
        load(&session, "r", "refuses").await;

        let (cb, rx) = reply();
        session.unload("r", cb);
        let failure = rx.await.unwrap().unwrap_err();

        assert_eq!(failure.code, FailureType::UnloadingPlugin);
        assert_eq!(session.state("r"), PluginState::Loaded);
    }

    #[tokio::test]
    async fn plugin_cannot_report_a_transport_failure() {
        let session = session(Arc::new(Notify::new()));
        load(&session, "f", "forges").await;

        let (cb, rx) = reply();
        session.execute("f", ExecuteRequest::default(), cb);
        let failure = rx.await.unwrap().unwrap_err();

        assert_eq!(failure.code, FailureType::ExecutingPlugin);
        assert_eq!(failure.message.as_deref(), Some("forged"));
        assert_eq!(session.state("f"), PluginState::Loaded);
    }

    #[tokio::test]
    async fn panicking_unload_hook_moves_to_exception() {
        let session = session(Arc::new(Notify::new()));
        load(&session, "f", "forges").await;

        let (cb, rx) = reply();
        session.unload("f", cb);
        let failure = rx.await.unwrap().unwrap_err();

        assert_eq!(failure.code, FailureType::UnloadingPlugin);
        assert_eq!(session.state("f"), PluginState::Exception);

        let (cb, rx) = reply();
        session.execute("f", ExecuteRequest::default(), cb);
        assert_eq!(
            rx.await.unwrap().unwrap_err().code,
            FailureType::ExecutingPlugin
        );
        assert_eq!(session.state("f"), PluginState::Exception);

        load(&session, "f", "echo").await;
        assert_eq!(session.state("f"), PluginState::Loaded);
    }

    #[tokio::test]
    async fn unload_from_exception_and_from_unknown() {
        let session = session(Arc::new(Notify::new()));
        load(&session, "b", "boom").await;
        let (cb, rx) = reply();
        session.execute("b", ExecuteRequest::default(), cb);
        let _ = rx.await.unwrap();

        let (cb, rx) = reply();
        session.unload("b", cb);
        rx.await.unwrap().unwrap();
        assert_eq!(session.state("b"), PluginState::Unloaded);

        let (cb, rx) = reply();
        session.unload("never", cb);
        assert_eq!(
            rx.await.unwrap().unwrap_err().code,
            FailureType::UnloadingPlugin
        );
    }

    #[tokio::test]
    async fn check_state_does_not_wait_for_execution() {
        let notify = Arc::new(Notify::new());
        let session = session(Arc::clone(&notify));
        load(&session, "g", "gate").await;

        let (cb, _rx) = reply();
        session.execute("g", ExecuteRequest::default(), cb);

        let (tx, rx) = oneshot::channel();
        session.check_state(
            "g",
            Box::new(move |snapshot: StateSnapshot| {
                let _ = tx.send(snapshot);
            }),
        );
        let snapshot = tokio::time::timeout(Duration::from_millis(100), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot, StateSnapshot::new("g", PluginState::Executing));

        notify.notify_one();
    }

    #[tokio::test]
    async fn shutdown_drops_in_flight_callbacks() {
        let session = session(Arc::new(Notify::new()));
        load(&session, "g", "gate").await;

        let (cb, rx) = reply();
        session.execute("g", ExecuteRequest::default(), cb);
        session.shutdown();

        assert!(rx.await.is_err());
        assert!(session.is_shut_down());
    }
}
