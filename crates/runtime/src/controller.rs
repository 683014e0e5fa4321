//! Caller-facing facade over one worker binding.

use std::sync::Arc;

use enclave_plugin::{
    ExecuteRequest, Payload, PayloadLimits, StateSnapshot, WorkerDescriptor,
};

use crate::binder::WorkerBinder;
use crate::bridge::{CallbackBridge, PendingRequestToken, RawReply, RequestKind};
use crate::completion::Completion;
use crate::context::ExecutionContext;
use crate::error::{PluginError, TransportError};
use crate::transport::WorkerChannel;

/// Load, execute, render, unload and query plugins in one worker.
///
/// Each operation acquires the binding (blocking for at most the bind
/// timeout when not yet bound), dispatches the call and returns. The outcome
/// is delivered once on the caller's [`ExecutionContext`], either through
/// the returned [`Completion`] or through the `*_with` callback.
///
/// Because of the bounded blocking acquire, call these from plain threads or
/// from `spawn_blocking`, not from inside an async task on a runtime that
/// also drives the transport.
#[derive(Clone)]
pub struct PluginController {
    binder: WorkerBinder,
    bridge: CallbackBridge,
    descriptor: Arc<WorkerDescriptor>,
    limits: PayloadLimits,
}

impl PluginController {
    pub(crate) fn new(
        binder: WorkerBinder,
        bridge: CallbackBridge,
        descriptor: Arc<WorkerDescriptor>,
        limits: PayloadLimits,
    ) -> Self {
        Self {
            binder,
            bridge,
            descriptor,
            limits,
        }
    }

    /// Worker this controller talks to.
    pub fn worker_id(&self) -> &str {
        self.descriptor.worker_id()
    }

    /// Descriptor used for loads.
    pub fn descriptor(&self) -> &WorkerDescriptor {
        &self.descriptor
    }

    /// The underlying binder.
    pub fn binder(&self) -> &WorkerBinder {
        &self.binder
    }

    /// Calls dispatched and not yet resolved.
    pub fn pending(&self) -> usize {
        self.bridge.pending()
    }

    /// Load the descriptor's entry point under `name`.
    pub fn load(&self, name: &str, ctx: &ExecutionContext) -> Completion<()> {
        let (tx, completion) = Completion::channel();
        self.load_with(name, ctx, move |result| {
            let _ = tx.send(result);
        });
        completion
    }

    /// [`load`](Self::load) with a completion callback.
    pub fn load_with(
        &self,
        name: &str,
        ctx: &ExecutionContext,
        done: impl FnOnce(Result<(), PluginError>) + Send + 'static,
    ) {
        let info = self.descriptor.plugin_info(name);
        self.dispatch(
            RequestKind::Load,
            name,
            ctx,
            move |reply| done(reply.and_then(RawReply::into_output).map(drop)),
            |channel, bridge, token| channel.load(info, Box::new(bridge.callback(token))),
        );
    }

    /// Execute `name` with `input`.
    pub fn execute(&self, name: &str, input: Payload, ctx: &ExecutionContext) -> Completion<Payload> {
        let (tx, completion) = Completion::channel();
        self.execute_with(name, input, ctx, move |result| {
            let _ = tx.send(result);
        });
        completion
    }

    /// [`execute`](Self::execute) with a completion callback.
    pub fn execute_with(
        &self,
        name: &str,
        input: Payload,
        ctx: &ExecutionContext,
        done: impl FnOnce(Result<Payload, PluginError>) + Send + 'static,
    ) {
        self.run(RequestKind::Execute, name, ExecuteRequest::execute(input), ctx, done);
    }

    /// Render through `name` with `input`.
    pub fn render(&self, name: &str, input: Payload, ctx: &ExecutionContext) -> Completion<Payload> {
        let (tx, completion) = Completion::channel();
        self.render_with(name, input, ctx, move |result| {
            let _ = tx.send(result);
        });
        completion
    }

    /// [`render`](Self::render) with a completion callback.
    pub fn render_with(
        &self,
        name: &str,
        input: Payload,
        ctx: &ExecutionContext,
        done: impl FnOnce(Result<Payload, PluginError>) + Send + 'static,
    ) {
        self.run(RequestKind::Render, name, ExecuteRequest::render(input), ctx, done);
    }

    /// Unload `name`.
    pub fn unload(&self, name: &str, ctx: &ExecutionContext) -> Completion<()> {
        let (tx, completion) = Completion::channel();
        self.unload_with(name, ctx, move |result| {
            let _ = tx.send(result);
        });
        completion
    }

    /// [`unload`](Self::unload) with a completion callback.
    pub fn unload_with(
        &self,
        name: &str,
        ctx: &ExecutionContext,
        done: impl FnOnce(Result<(), PluginError>) + Send + 'static,
    ) {
        self.dispatch(
            RequestKind::Unload,
            name,
            ctx,
            move |reply| done(reply.and_then(RawReply::into_output).map(drop)),
            |channel, bridge, token| channel.unload(name, Box::new(bridge.callback(token))),
        );
    }

    /// Query the lifecycle state of `name`.
    pub fn check_state(&self, name: &str, ctx: &ExecutionContext) -> Completion<StateSnapshot> {
        let (tx, completion) = Completion::channel();
        self.check_state_with(name, ctx, move |result| {
            let _ = tx.send(result);
        });
        completion
    }

    /// [`check_state`](Self::check_state) with a completion callback.
    pub fn check_state_with(
        &self,
        name: &str,
        ctx: &ExecutionContext,
        done: impl FnOnce(Result<StateSnapshot, PluginError>) + Send + 'static,
    ) {
        self.dispatch(
            RequestKind::CheckState,
            name,
            ctx,
            move |reply| done(reply.and_then(RawReply::into_state)),
            |channel, bridge, token| channel.check_state(name, Box::new(bridge.state_callback(token))),
        );
    }

    /// Release the binding. Calls still in flight fail as connection lost.
    ///
    /// Controllers created for the same worker share the binding, so this
    /// affects them too. The next call binds again.
    pub fn close(&self) {
        self.binder.release();
    }

    fn run(
        &self,
        kind: RequestKind,
        name: &str,
        request: ExecuteRequest,
        ctx: &ExecutionContext,
        done: impl FnOnce(Result<Payload, PluginError>) + Send + 'static,
    ) {
        if let Err(e) = self.limits.check(&request.input) {
            tracing::warn!(worker_id = %self.worker_id(), plugin = %name, error = %e, "input rejected");
            ctx.dispatch(move || done(Err(e.into())));
            return;
        }

        self.dispatch(
            kind,
            name,
            ctx,
            move |reply| done(reply.and_then(RawReply::into_output)),
            |channel, bridge, token| channel.execute(name, request, Box::new(bridge.callback(token))),
        );
    }

    fn dispatch(
        &self,
        kind: RequestKind,
        name: &str,
        ctx: &ExecutionContext,
        deliver: impl FnOnce(Result<RawReply, PluginError>) + Send + 'static,
        call: impl FnOnce(&dyn WorkerChannel, &CallbackBridge, PendingRequestToken) -> Result<(), TransportError>,
    ) {
        let channel = match self.binder.acquire() {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(
                    worker_id = %self.worker_id(),
                    plugin = %name,
                    %kind,
                    error = %e,
                    "no binding for call"
                );
                ctx.dispatch(move || deliver(Err(e.into())));
                return;
            }
        };

        let token = self.bridge.register(kind, ctx, deliver);
        tracing::debug!(
            worker_id = %self.worker_id(),
            plugin = %name,
            %kind,
            token = token.id(),
            "dispatching call"
        );

        // The callback was dropped with the failed call and has resolved the token.
        if let Err(e) = call(channel.as_ref(), &self.bridge, token) {
            tracing::warn!(
                worker_id = %self.worker_id(),
                plugin = %name,
                %kind,
                error = %e,
                "dispatch failed"
            );
        }
    }
}

impl std::fmt::Debug for PluginController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginController")
            .field("worker_id", &self.worker_id())
            .field("state", &self.binder.state())
            .field("pending", &self.pending())
            .finish()
    }
}
