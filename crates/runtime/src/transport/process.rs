//! Workers as child processes speaking the line protocol.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use enclave_plugin_protocol::{
    DEFAULT_MAX_FRAME_BYTES, HostFrame, PROTOCOL_VERSION, ProtocolError, WorkerFrame, read_frame,
    write_frame,
};
use parking_lot::Mutex;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::channel::FrameChannel;
use super::{ConnectionEvents, Transport, WorkerRuntime};
use crate::registry::Endpoint;

/// Spawns `endpoint.component` as an executable per bind.
///
/// The child must write a `ready` frame on stdout before it counts as
/// connected. Its stderr is inherited. Unbinding kills the child.
pub struct ProcessTransport {
    runtime: WorkerRuntime,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    max_frame_bytes: usize,
    children: Mutex<HashMap<String, CancellationToken>>,
}

impl ProcessTransport {
    /// Transport with its own I/O runtime.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self::with_runtime(WorkerRuntime::owned("enclave-process")?))
    }

    /// Transport driving child I/O on an existing runtime.
    pub fn with_handle(handle: Handle) -> Self {
        Self::with_runtime(WorkerRuntime::borrowed(handle))
    }

    fn with_runtime(runtime: WorkerRuntime) -> Self {
        Self {
            runtime,
            args: Vec::new(),
            envs: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Arguments passed to every spawned worker.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Extra environment variable for every spawned worker.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Largest frame accepted in either direction.
    #[must_use]
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Whether a child is running for `component`.
    pub fn is_bound(&self, component: &str) -> bool {
        self.children.lock().contains_key(component)
    }

    fn spawn(&self, endpoint: &Endpoint) -> std::io::Result<(Child, ChildStdin, ChildStdout)> {
        let _guard = self.runtime.handle().enter();
        let mut child = Command::new(&endpoint.component)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => Ok((child, stdin, stdout)),
            _ => Err(std::io::Error::other("worker pipes were not captured")),
        }
    }
}

impl Transport for ProcessTransport {
    fn bind(&self, endpoint: &Endpoint, events: ConnectionEvents) -> bool {
        let (child, stdin, stdout) = match self.spawn(endpoint) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::warn!(component = %endpoint.component, error = %e, "failed to spawn worker");
                return false;
            }
        };
        tracing::info!(component = %endpoint.component, pid = child.id(), "worker process spawned");

        let cancel = CancellationToken::new();
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(FrameChannel::new(endpoint.component.clone(), host_tx));
        let handle = self.runtime.handle();

        handle.spawn(write_loop(
            stdin,
            host_rx,
            Arc::clone(&channel),
            cancel.clone(),
            self.max_frame_bytes,
        ));
        handle.spawn(supervise(
            Session {
                component: endpoint.component.clone(),
                child,
                stdout,
                channel,
                events,
                cancel: cancel.clone(),
            },
            self.max_frame_bytes,
        ));

        if let Some(previous) = self.children.lock().insert(endpoint.component.clone(), cancel) {
            previous.cancel();
        }
        true
    }

    fn unbind(&self, endpoint: &Endpoint) {
        if let Some(cancel) = self.children.lock().remove(&endpoint.component) {
            tracing::debug!(component = %endpoint.component, "stopping worker process");
            cancel.cancel();
        }
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        for (_, cancel) in self.children.get_mut().drain() {
            cancel.cancel();
        }
    }
}

impl std::fmt::Debug for ProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTransport")
            .field("args", &self.args)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("children", &self.children.lock().len())
            .finish_non_exhaustive()
    }
}

async fn write_loop(
    mut stdin: ChildStdin,
    mut frames: mpsc::UnboundedReceiver<HostFrame>,
    channel: Arc<FrameChannel>,
    cancel: CancellationToken,
    max_frame_bytes: usize,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let Some(frame) = frame else { break };

        match write_frame(&mut stdin, &frame, max_frame_bytes).await {
            Ok(()) => {}
            Err(ProtocolError::FrameTooLarge { limit, actual }) => {
                if let Some(id) = frame.id() {
                    channel.abandon(id, &format!("request frame of {actual} bytes exceeds {limit}"));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "worker stdin closed");
                break;
            }
        }
    }
}

struct Session {
    component: String,
    child: Child,
    stdout: ChildStdout,
    channel: Arc<FrameChannel>,
    events: ConnectionEvents,
    cancel: CancellationToken,
}

async fn supervise(session: Session, max_frame_bytes: usize) {
    let Session {
        component,
        mut child,
        stdout,
        channel,
        events,
        cancel,
    } = session;
    let mut reader = BufReader::new(stdout);
    let mut connected = false;

    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = read_frame::<_, WorkerFrame>(&mut reader, max_frame_bytes) => frame,
        };

        match frame {
            Ok(Some(WorkerFrame::Ready { protocol_version })) if !connected => {
                if protocol_version != PROTOCOL_VERSION {
                    let e = ProtocolError::VersionMismatch {
                        expected: PROTOCOL_VERSION,
                        actual: protocol_version,
                    };
                    tracing::warn!(component = %component, error = %e, "refusing worker");
                    events.null_binding();
                    break;
                }
                connected = true;
                events.connected(channel.clone());
            }
            Ok(Some(reply)) => channel.route(reply),
            Ok(None) => {
                tracing::warn!(component = %component, "worker closed its stdout");
                events.binding_died();
                break;
            }
            Err(e) => {
                tracing::warn!(component = %component, error = %e, "worker stream broken");
                events.binding_died();
                break;
            }
        }
    }

    cancel.cancel();
    channel.close();
    if let Err(e) = child.start_kill() {
        tracing::debug!(component = %component, error = %e, "worker already exited");
    }
    match child.wait().await {
        Ok(status) => tracing::info!(component = %component, %status, "worker process exited"),
        Err(e) => tracing::warn!(component = %component, error = %e, "failed to reap worker"),
    }
}
