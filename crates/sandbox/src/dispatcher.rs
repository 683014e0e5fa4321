//! Boundary between decoded host frames and the worker session.

use std::ops::ControlFlow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use enclave_plugin::{
    Failure, FailureType, Payload, PluginCallback, PluginState, StateCallback, StateSnapshot,
};
use enclave_plugin_protocol::{HostFrame, RequestId, WorkerFrame};
use tokio::sync::mpsc;

use crate::error::panic_message;
use crate::session::WorkerSession;

/// Routes host frames to a [`WorkerSession`] and turns completions into
/// reply frames.
///
/// Every frame carrying a request id produces exactly one reply. A callback
/// that is dropped without firing (dispatch panicked, session shut down)
/// still replies, with the operation's failure code; a state query replies
/// `Exception`.
#[derive(Debug, Clone)]
pub struct SessionDispatcher {
    session: Arc<WorkerSession>,
    replies: mpsc::UnboundedSender<WorkerFrame>,
}

impl SessionDispatcher {
    /// Dispatcher writing replies into `replies`.
    pub fn new(session: Arc<WorkerSession>, replies: mpsc::UnboundedSender<WorkerFrame>) -> Self {
        Self { session, replies }
    }

    /// Session behind this dispatcher.
    pub fn session(&self) -> &Arc<WorkerSession> {
        &self.session
    }

    /// Handle one frame. Breaks on [`HostFrame::Shutdown`].
    pub fn dispatch(&self, frame: HostFrame) -> ControlFlow<()> {
        let session = &self.session;
        match frame {
            HostFrame::Load { id, info } => {
                let reply = self.reply(id, FailureType::LoadingPlugin);
                guarded(id, "load", || session.load(info, reply));
            }
            HostFrame::Execute {
                id,
                plugin,
                request,
            } => {
                let reply = self.reply(id, FailureType::ExecutingPlugin);
                guarded(id, "execute", || session.execute(&plugin, request, reply));
            }
            HostFrame::Unload { id, plugin } => {
                let reply = self.reply(id, FailureType::UnloadingPlugin);
                guarded(id, "unload", || session.unload(&plugin, reply));
            }
            HostFrame::CheckState { id, plugin } => {
                let reply = Box::new(StateReply {
                    id,
                    plugin: plugin.clone(),
                    replies: Some(self.replies.clone()),
                });
                guarded(id, "check_state", || session.check_state(&plugin, reply));
            }
            HostFrame::Shutdown => {
                session.shutdown();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Reply with a failure for a frame that could not be decoded.
    pub fn reject(&self, id: RequestId, failure: Failure) {
        let _ = self.replies.send(WorkerFrame::Failure { id, failure });
    }

    fn reply(&self, id: RequestId, code: FailureType) -> Box<dyn PluginCallback> {
        Box::new(FrameReply {
            id,
            code,
            replies: Some(self.replies.clone()),
        })
    }
}

fn guarded(id: RequestId, op: &'static str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(
            request_id = id,
            op,
            message = %panic_message(panic.as_ref()),
            "dispatch panicked"
        );
    }
}

struct FrameReply {
    id: RequestId,
    code: FailureType,
    replies: Option<mpsc::UnboundedSender<WorkerFrame>>,
}

impl FrameReply {
    fn send(&mut self, frame: WorkerFrame) {
        if let Some(replies) = self.replies.take() {
            let _ = replies.send(frame);
        }
    }
}

impl PluginCallback for FrameReply {
    fn on_success(mut self: Box<Self>, output: Payload) {
        let id = self.id;
        self.send(WorkerFrame::Success { id, output });
    }

    fn on_failure(mut self: Box<Self>, failure: Failure) {
        let id = self.id;
        self.send(WorkerFrame::Failure { id, failure });
    }
}

impl Drop for FrameReply {
    fn drop(&mut self) {
        if self.replies.is_some() {
            let failure = Failure::new(self.code).with_message("request dropped without a reply");
            let id = self.id;
            self.send(WorkerFrame::Failure { id, failure });
        }
    }
}

struct StateReply {
    id: RequestId,
    plugin: String,
    replies: Option<mpsc::UnboundedSender<WorkerFrame>>,
}

impl StateCallback for StateReply {
    fn on_state(mut self: Box<Self>, snapshot: StateSnapshot) {
        if let Some(replies) = self.replies.take() {
            let _ = replies.send(WorkerFrame::State {
                id: self.id,
                snapshot,
            });
        }
    }
}

impl Drop for StateReply {
    fn drop(&mut self) {
        if let Some(replies) = self.replies.take() {
            let snapshot = StateSnapshot::new(std::mem::take(&mut self.plugin), PluginState::Exception);
            let _ = replies.send(WorkerFrame::State {
                id: self.id,
                snapshot,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use enclave_plugin::{ExecuteRequest, Plugin, PluginContext, PluginInfo};
    use pretty_assertions::assert_eq;
    use tokio::runtime::Handle;

    use super::*;
    use crate::FactoryLoader;

    struct Echo;

    #[async_trait]
    impl Plugin for Echo {
        async fn execute(&self, r: ExecuteRequest, _: &PluginContext) -> Result<Payload, Failure> {
            Ok(r.input)
        }
    }

    fn dispatcher() -> (SessionDispatcher, mpsc::UnboundedReceiver<WorkerFrame>) {
        let loader = FactoryLoader::new().with_plugin("echo", || Echo);
        let session = Arc::new(WorkerSession::new(Arc::new(loader), Handle::current()));
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionDispatcher::new(session, tx), rx)
    }

    #[tokio::test]
    async fn each_request_gets_one_reply() {
        let (dispatcher, mut rx) = dispatcher();

        let info = PluginInfo {
            name: "p1".into(),
            entry_point: "echo".into(),
            archives: Vec::new(),
            init_data: Payload::new(),
        };
        assert!(dispatcher.dispatch(HostFrame::Load { id: 1, info }).is_continue());
        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerFrame::Success {
                id: 1,
                output: Payload::new()
            }
        );

        dispatcher.dispatch(HostFrame::Execute {
            id: 2,
            plugin: "p1".into(),
            request: ExecuteRequest::execute(Payload::new().with("op", "x")),
        });
        let WorkerFrame::Success { id, output } = rx.recv().await.unwrap() else {
            panic!("expected success");
        };
        assert_eq!(id, 2);
        assert_eq!(output.get_str("op"), Some("x"));

        dispatcher.dispatch(HostFrame::CheckState {
            id: 3,
            plugin: "p1".into(),
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerFrame::State {
                id: 3,
                snapshot: StateSnapshot::new("p1", PluginState::Loaded)
            }
        );

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_callback_still_replies_with_operation_code() {
        let (dispatcher, mut rx) = dispatcher();
        drop(dispatcher.reply(9, FailureType::UnloadingPlugin));

        let WorkerFrame::Failure { id, failure } = rx.recv().await.unwrap() else {
            panic!("expected failure");
        };
        assert_eq!(id, 9);
        assert_eq!(failure.code, FailureType::UnloadingPlugin);
    }

    #[tokio::test]
    async fn panicking_state_query_reports_exception() {
        let (dispatcher, mut rx) = dispatcher();
        let reply = Box::new(StateReply {
            id: 4,
            plugin: "p1".into(),
            replies: Some(dispatcher.replies.clone()),
        });
        guarded(4, "check_state", move || {
            let _held = reply;
            panic!("query failed");
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerFrame::State {
                id: 4,
                snapshot: StateSnapshot::new("p1", PluginState::Exception)
            }
        );
    }

    #[tokio::test]
    async fn shutdown_breaks_the_loop() {
        let (dispatcher, _rx) = dispatcher();
        assert!(dispatcher.dispatch(HostFrame::Shutdown).is_break());
        assert!(dispatcher.session().is_shut_down());
    }
}
