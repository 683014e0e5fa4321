//! The vendor-facing Plugin trait and its execution context.

use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{Failure, Payload, Value};

/// Which entry of the plugin an execute call targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Business logic.
    #[default]
    Execute,
    /// Produce render data for presentation.
    Render,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Execute => "execute",
            Self::Render => "render",
        })
    }
}

/// One execute call as seen by plugin code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Targeted operation.
    #[serde(default)]
    pub operation: Operation,
    /// Caller-supplied input.
    #[serde(default)]
    pub input: Payload,
}

impl ExecuteRequest {
    /// Execute request with `input`.
    pub fn execute(input: Payload) -> Self {
        Self {
            operation: Operation::Execute,
            input,
        }
    }

    /// Render request with `input`.
    pub fn render(input: Payload) -> Self {
        Self {
            operation: Operation::Render,
            input,
        }
    }
}

/// Everything a plugin instance may read or write.
///
/// Created by the session on load and dropped on unload. Init data is
/// read-only; the scratch bundle survives between execute calls of the same
/// instance.
#[derive(Debug)]
pub struct PluginContext {
    plugin: String,
    init_data: Payload,
    scratch: Mutex<Payload>,
}

impl PluginContext {
    /// Fresh context for the instance `plugin`.
    pub fn new(plugin: impl Into<String>, init_data: Payload) -> Self {
        Self {
            plugin: plugin.into(),
            init_data,
            scratch: Mutex::new(Payload::new()),
        }
    }

    /// Instance name.
    #[inline]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Data supplied by the host at load time.
    #[inline]
    pub fn init_data(&self) -> &Payload {
        &self.init_data
    }

    /// Read a scratch value.
    pub fn scratch_get(&self, key: &str) -> Option<Value> {
        self.scratch.lock().get(key).cloned()
    }

    /// Write a scratch value, returning the previous one.
    pub fn scratch_put(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.scratch.lock().insert(key, value)
    }

    /// Copy of the whole scratch bundle.
    pub fn scratch_snapshot(&self) -> Payload {
        self.scratch.lock().clone()
    }
}

/// Vendor plugin code.
///
/// Implementations must not assume any particular thread: calls arrive on
/// the worker session's runtime. Object-safe, so sessions hold
/// `Arc<dyn Plugin>`.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Run one request.
    ///
    /// A returned [`Failure`] is forwarded to the caller unchanged and the
    /// instance stays usable. A panic moves the instance to
    /// [`PluginState::Exception`](crate::PluginState::Exception).
    async fn execute(&self, request: ExecuteRequest, ctx: &PluginContext)
    -> Result<Payload, Failure>;

    /// Release instance resources before the session drops it.
    fn on_unload(&self, _ctx: &PluginContext) -> Result<(), Failure> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;

    struct Counter;

    #[async_trait]
    impl Plugin for Counter {
        async fn execute(
            &self,
            request: ExecuteRequest,
            ctx: &PluginContext,
        ) -> Result<Payload, Failure> {
            let seen = match ctx.scratch_get("seen") {
                Some(Value::Int(n)) => n + 1,
                _ => 1,
            };
            ctx.scratch_put("seen", seen);
            Ok(Payload::new()
                .with("seen", seen)
                .with("op", request.operation.to_string()))
        }
    }

    #[tokio::test]
    async fn scratch_survives_between_calls() {
        let plugin: Arc<dyn Plugin> = Arc::new(Counter);
        let ctx = PluginContext::new("p1", Payload::new());

        plugin
            .execute(ExecuteRequest::execute(Payload::new()), &ctx)
            .await
            .unwrap();
        let out = plugin
            .execute(ExecuteRequest::render(Payload::new()), &ctx)
            .await
            .unwrap();

        assert_eq!(out.get_i64("seen"), Some(2));
        assert_eq!(out.get_str("op"), Some("render"));
        assert!(plugin.on_unload(&ctx).is_ok());
    }

    #[test]
    fn request_defaults_to_execute() {
        let request: ExecuteRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.operation, Operation::Execute);
        assert!(request.input.is_empty());
    }
}
