//! Worker process hosting demo plugins, used by the process transport tests.
//!
//! Entry points:
//! - `echo` -- returns the input plus `plugin` and `operation` keys
//! - `upper` -- upper-cases every string value
//! - `slow` -- sleeps `delay_ms` (default 500) then echoes
//! - `panic` -- panics on every call
//! - `fail` -- returns an execute failure carrying `reason`
//! - `counter` -- counts calls in the instance scratch
//! - `exit` -- terminates the process with `code` (default 3)
//!
//! Logs go to stderr; stdout carries frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use enclave_plugin::{ExecuteRequest, Failure, Payload, Plugin, PluginContext, Value};
use enclave_sandbox::{FactoryLoader, WorkerSession, serve_stdio};

struct Echo;

#[async_trait]
impl Plugin for Echo {
    async fn execute(&self, request: ExecuteRequest, ctx: &PluginContext) -> Result<Payload, Failure> {
        Ok(echo(request, ctx))
    }
}

struct Upper;

#[async_trait]
impl Plugin for Upper {
    async fn execute(&self, request: ExecuteRequest, _ctx: &PluginContext) -> Result<Payload, Failure> {
        Ok(request
            .input
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(s) => (key, Value::String(s.to_uppercase())),
                other => (key, other),
            })
            .collect())
    }
}

struct Slow;

#[async_trait]
impl Plugin for Slow {
    async fn execute(&self, request: ExecuteRequest, ctx: &PluginContext) -> Result<Payload, Failure> {
        let delay = request.input.get_i64("delay_ms").unwrap_or(500).max(0);
        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        Ok(echo(request, ctx))
    }
}

struct Panics;

#[async_trait]
impl Plugin for Panics {
    async fn execute(&self, _request: ExecuteRequest, ctx: &PluginContext) -> Result<Payload, Failure> {
        panic!("plugin '{}' panicked on purpose", ctx.plugin());
    }
}

struct Fails;

#[async_trait]
impl Plugin for Fails {
    async fn execute(&self, request: ExecuteRequest, _ctx: &PluginContext) -> Result<Payload, Failure> {
        let reason = request.input.get_str("reason").unwrap_or("requested failure");
        Err(Failure::executing(reason))
    }
}

struct Counter;

#[async_trait]
impl Plugin for Counter {
    async fn execute(&self, _request: ExecuteRequest, ctx: &PluginContext) -> Result<Payload, Failure> {
        let count = ctx
            .scratch_get("count")
            .and_then(|v| if let Value::Int(n) = v { Some(n) } else { None })
            .unwrap_or(0)
            + 1;
        ctx.scratch_put("count", count);
        Ok(Payload::new().with("count", count))
    }
}

struct Exit;

#[async_trait]
impl Plugin for Exit {
    async fn execute(&self, request: ExecuteRequest, _ctx: &PluginContext) -> Result<Payload, Failure> {
        let code = request.input.get_i64("code").unwrap_or(3) as i32;
        tracing::warn!(code, "exiting on request");
        std::process::exit(code);
    }
}

fn echo(request: ExecuteRequest, ctx: &PluginContext) -> Payload {
    request
        .input
        .with("plugin", ctx.plugin())
        .with("operation", request.operation.to_string())
}

fn loader() -> FactoryLoader {
    FactoryLoader::new()
        .with_plugin("echo", || Echo)
        .with_plugin("upper", || Upper)
        .with_plugin("slow", || Slow)
        .with_plugin("panic", || Panics)
        .with_plugin("fail", || Fails)
        .with_plugin("counter", || Counter)
        .with_plugin("exit", || Exit)
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let config = enclave_log::Config::from_env().with_service("enclave-worker-fixture");
    let _guard = enclave_log::init_with(config);

    let session = Arc::new(WorkerSession::new(
        Arc::new(loader()),
        tokio::runtime::Handle::current(),
    ));

    match serve_stdio(session).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "worker stopped");
            std::process::ExitCode::FAILURE
        }
    }
}
