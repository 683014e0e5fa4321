//! The isolated worker's frame loop.

use std::sync::Arc;
use std::time::Duration;

use enclave_plugin::{Failure, FailureType};
use enclave_plugin_protocol::{
    DEFAULT_MAX_FRAME_BYTES, HostFrame, ProtocolError, WorkerFrame, read_frame, write_frame,
};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;

use crate::dispatcher::SessionDispatcher;
use crate::session::WorkerSession;

/// How long replies of cancelled executions get to drain after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Serve host frames from `reader`, writing replies to `writer`.
///
/// Writes [`WorkerFrame::Ready`] first, then dispatches until EOF or
/// [`HostFrame::Shutdown`]. The session is shut down on exit.
pub async fn serve<R, W>(
    mut reader: R,
    writer: W,
    session: Arc<WorkerSession>,
) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, rx));
    let dispatcher = SessionDispatcher::new(Arc::clone(&session), tx);

    tracing::info!("worker ready");

    let result = loop {
        let value = match read_frame::<_, serde_json::Value>(&mut reader, DEFAULT_MAX_FRAME_BYTES).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                tracing::info!("host closed the channel");
                break Ok(());
            }
            Err(ProtocolError::Json(e)) => {
                tracing::warn!(error = %e, "skipping malformed line");
                continue;
            }
            Err(e) => break Err(e),
        };

        let frame = match serde_json::from_value::<HostFrame>(value.clone()) {
            Ok(frame) => frame,
            Err(e) => {
                reject_malformed(&dispatcher, &value, &e);
                continue;
            }
        };

        if dispatcher.dispatch(frame).is_break() {
            tracing::info!("shutdown requested");
            break Ok(());
        }
    };

    session.shutdown();
    drop(dispatcher);
    if tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await.is_err() {
        tracing::warn!("reply writer did not drain in time");
    }
    result
}

/// [`serve`] over the process's stdin and stdout.
pub async fn serve_stdio(session: Arc<WorkerSession>) -> Result<(), ProtocolError> {
    serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), session).await
}

fn reject_malformed(dispatcher: &SessionDispatcher, value: &serde_json::Value, error: &serde_json::Error) {
    let Some(id) = value.get("id").and_then(serde_json::Value::as_u64) else {
        tracing::warn!(%error, "dropping frame without request id");
        return;
    };
    let code = match value.get("type").and_then(serde_json::Value::as_str) {
        Some("load") => FailureType::LoadingPlugin,
        Some("execute") => FailureType::ExecutingPlugin,
        Some("unload") => FailureType::UnloadingPlugin,
        _ => FailureType::Unknown,
    };
    tracing::warn!(request_id = id, %error, "rejecting malformed frame");
    dispatcher.reject(id, Failure::new(code).with_message(format!("malformed frame: {error}")));
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<WorkerFrame>)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = write_frame(&mut writer, &WorkerFrame::ready(), DEFAULT_MAX_FRAME_BYTES).await {
        tracing::error!(error = %e, "failed to write ready frame");
        return;
    }

    while let Some(frame) = rx.recv().await {
        let written = match write_frame(&mut writer, &frame, DEFAULT_MAX_FRAME_BYTES).await {
            Err(ProtocolError::FrameTooLarge { limit, actual }) => {
                let Some(id) = frame.id() else { continue };
                tracing::warn!(request_id = id, limit, actual, "reply too large");
                let failure = Failure::executing(format!("reply is {actual} bytes, limit is {limit}"));
                write_frame(
                    &mut writer,
                    &WorkerFrame::Failure { id, failure },
                    DEFAULT_MAX_FRAME_BYTES,
                )
                .await
            }
            other => other,
        };
        if let Err(e) = written {
            tracing::error!(error = %e, "reply writer failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use enclave_plugin::{
        ExecuteRequest, Payload, Plugin, PluginContext, PluginInfo, PluginState, StateSnapshot,
    };
    use enclave_plugin_protocol::encode_line;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncWriteExt, duplex};
    use tokio::runtime::Handle;

    use super::*;
    use crate::FactoryLoader;

    struct Upper;

    #[async_trait]
    impl Plugin for Upper {
        async fn execute(&self, r: ExecuteRequest, _: &PluginContext) -> Result<Payload, Failure> {
            let text = r.input.get_str("text").unwrap_or_default().to_uppercase();
            Ok(Payload::new().with("text", text))
        }
    }

    fn line(frame: &HostFrame) -> Vec<u8> {
        encode_line(frame, DEFAULT_MAX_FRAME_BYTES).unwrap()
    }

    async fn next(reader: &mut BufReader<tokio::io::DuplexStream>) -> WorkerFrame {
        read_frame(reader, DEFAULT_MAX_FRAME_BYTES).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        enclave_log::init_test();
        let loader = FactoryLoader::new().with_plugin("upper", || Upper);
        let session = Arc::new(WorkerSession::new(Arc::new(loader), Handle::current()));

        let (mut host_tx, worker_rx) = duplex(64 * 1024);
        let (worker_tx, host_rx) = duplex(64 * 1024);
        let server = tokio::spawn(serve(BufReader::new(worker_rx), worker_tx, Arc::clone(&session)));
        let mut host_rx = BufReader::new(host_rx);

        assert_eq!(next(&mut host_rx).await, WorkerFrame::ready());

        let info = PluginInfo {
            name: "p1".into(),
            entry_point: "upper".into(),
            archives: Vec::new(),
            init_data: Payload::new(),
        };
        host_tx.write_all(&line(&HostFrame::Load { id: 1, info })).await.unwrap();
        assert_eq!(next(&mut host_rx).await.id(), Some(1));

        host_tx
            .write_all(&line(&HostFrame::Execute {
                id: 2,
                plugin: "p1".into(),
                request: ExecuteRequest::execute(Payload::new().with("text", "abc")),
            }))
            .await
            .unwrap();
        let WorkerFrame::Success { output, .. } = next(&mut host_rx).await else {
            panic!("expected success");
        };
        assert_eq!(output.get_str("text"), Some("ABC"));

        host_tx.write_all(&line(&HostFrame::Shutdown)).await.unwrap();
        server.await.unwrap().unwrap();
        assert!(session.is_shut_down());
    }

    #[tokio::test]
    async fn malformed_frame_with_id_gets_a_failure() {
        let session = Arc::new(WorkerSession::new(Arc::new(FactoryLoader::new()), Handle::current()));
        let (mut host_tx, worker_rx) = duplex(4096);
        let (worker_tx, host_rx) = duplex(4096);
        let server = tokio::spawn(serve(BufReader::new(worker_rx), worker_tx, session));
        let mut host_rx = BufReader::new(host_rx);
        let _ready = next(&mut host_rx).await;

        host_tx
            .write_all(b"{\"type\":\"execute\",\"id\":5}\n")
            .await
            .unwrap();
        let WorkerFrame::Failure { id, failure } = next(&mut host_rx).await else {
            panic!("expected failure");
        };
        assert_eq!(id, 5);
        assert_eq!(failure.code, FailureType::ExecutingPlugin);

        host_tx
            .write_all(&line(&HostFrame::CheckState {
                id: 6,
                plugin: "ghost".into(),
            }))
            .await
            .unwrap();
        assert_eq!(
            next(&mut host_rx).await,
            WorkerFrame::State {
                id: 6,
                snapshot: StateSnapshot::new("ghost", PluginState::NotLoaded)
            }
        );

        drop(host_tx);
        server.await.unwrap().unwrap();
    }
}
