//! Where completions run.

use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;

/// A unit of completion work.
pub type CompletionTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs completion handlers on the caller's terms.
///
/// Implementations must not run the task inline on the calling thread:
/// completions are posted from transport threads, and running them there
/// invites reentrancy into the binder.
pub trait CompletionExecutor: Send + Sync + 'static {
    /// Schedule `task`.
    fn execute(&self, task: CompletionTask);
}

impl CompletionExecutor for Handle {
    fn execute(&self, task: CompletionTask) {
        self.spawn(async move { task() });
    }
}

/// Caller-chosen execution context for completion delivery.
#[derive(Clone)]
pub struct ExecutionContext {
    executor: Arc<dyn CompletionExecutor>,
}

impl ExecutionContext {
    /// Context backed by any executor.
    pub fn new(executor: impl CompletionExecutor) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }

    /// Context spawning completions onto a tokio runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self::new(handle)
    }

    /// Context on the current tokio runtime, if called inside one.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::from_handle)
    }

    /// Post a task.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        self.executor.execute(Box::new(task));
    }
}

impl From<Handle> for ExecutionContext {
    fn from(handle: Handle) -> Self {
        Self::from_handle(handle)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext").finish_non_exhaustive()
    }
}
