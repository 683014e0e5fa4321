//! Controller and manager behaviour against an in-process worker.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use enclave_plugin::{Failure, FailureType, Payload, PluginState};
use enclave_runtime::{
    BindError, ConnectionState, Endpoint, ExecutionContext, InProcessTransport, ManagerError,
    PluginError, PluginManager, ResolveError, RuntimeConfig, StaticRegistry,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use common::{COMPONENT, Echo, Harness, WORKER, descriptor};

fn state(h: &Harness, controller: &enclave_runtime::PluginController, name: &str) -> PluginState {
    controller.check_state(name, &h.ctx).wait().unwrap().state
}

#[test]
fn create_without_endpoint_is_service_not_found() {
    let h = Harness::new();
    assert!(h.registry.remove(&Endpoint::new(WORKER, COMPONENT)));

    let err = h.manager.create(descriptor(WORKER, "echo")).unwrap_err();

    assert_eq!(
        err,
        ManagerError::ServiceNotFound {
            worker_id: WORKER.into(),
            source: BindError::Resolution(ResolveError::NotFound {
                worker_id: WORKER.into()
            }),
        }
    );
    assert_eq!(h.transport.binds(), 0);
    assert!(h.manager.binder(WORKER).is_none());
}

#[test]
fn failed_creates_leave_no_binding_behind() {
    let h = Harness::new();
    let existing = h.controller("echo");

    for worker_id in ["w7", "w8", "w9"] {
        assert!(h.manager.create(descriptor(worker_id, "echo")).is_err());
        assert!(h.manager.binder(worker_id).is_none());
    }

    assert!(h.registry.remove(&Endpoint::new(WORKER, COMPONENT)));
    existing.close();
    assert!(h.manager.create(descriptor(WORKER, "echo")).is_err());
    assert!(h.manager.binder(WORKER).is_some());
}

#[test]
fn create_binds_eagerly() {
    let h = Harness::new();
    let controller = h.controller("echo");

    assert_eq!(h.transport.binds(), 1);
    assert_ne!(controller.binder().state(), ConnectionState::Unbound);
}

#[test]
fn load_then_execute_echoes_input() {
    let h = Harness::new();
    let controller = h.controller("echo");

    controller.load("p1", &h.ctx).wait().unwrap();
    let output = controller
        .execute("p1", Payload::new().with("op", "x"), &h.ctx)
        .wait()
        .unwrap();

    assert_eq!(output.get_str("op"), Some("x"));
    assert_eq!(output.get_str("plugin"), Some("p1"));
    assert_eq!(output.get_str("operation"), Some("execute"));
    assert_eq!(state(&h, &controller, "p1"), PluginState::Loaded);
}

#[test]
fn render_is_tagged() {
    let h = Harness::new();
    let controller = h.controller("echo");
    controller.load("p1", &h.ctx).wait().unwrap();

    let output = controller.render("p1", Payload::new(), &h.ctx).wait().unwrap();

    assert_eq!(output.get_str("operation"), Some("render"));
}

#[test]
fn execute_on_never_loaded_plugin_fails_without_side_effects() {
    let h = Harness::new();
    let controller = h.controller("echo");

    let err = controller
        .execute("ghost", Payload::new().with("op", "x"), &h.ctx)
        .wait()
        .unwrap_err();

    let PluginError::Execute(failure) = &err else {
        panic!("expected an execute failure, got {err:?}");
    };
    assert_eq!(failure.code, FailureType::ExecutingPlugin);
    assert_eq!(err.failure_type(), Some(FailureType::ExecutingPlugin));
    assert_eq!(state(&h, &controller, "ghost"), PluginState::NotLoaded);
}

#[test]
fn execute_while_executing_is_rejected() {
    let h = Harness::new();
    let controller = h.controller("hold");
    controller.load("p1", &h.ctx).wait().unwrap();

    let first = controller.execute("p1", Payload::new().with("n", 1), &h.ctx);
    h.wait_started();

    let second = controller.execute("p1", Payload::new().with("n", 2), &h.ctx).wait();
    assert!(
        matches!(&second, Err(PluginError::Execute(f)) if f.code == FailureType::ExecutingPlugin),
        "{second:?}"
    );
    assert_eq!(state(&h, &controller, "p1"), PluginState::Executing);

    h.release.add_permits(1);
    assert_eq!(first.wait().unwrap().get_i64("n"), Some(1));
    assert_eq!(state(&h, &controller, "p1"), PluginState::Loaded);
}

#[test]
fn check_state_does_not_wait_for_execution() {
    let h = Harness::new();
    let controller = h.controller("hold");
    controller.load("p1", &h.ctx).wait().unwrap();
    let running = controller.execute("p1", Payload::new(), &h.ctx);
    h.wait_started();

    let started = Instant::now();
    assert_eq!(state(&h, &controller, "p1"), PluginState::Executing);
    assert!(started.elapsed() < Duration::from_millis(500));

    h.release.add_permits(1);
    running.wait().unwrap();
}

#[test]
fn panic_is_contained_and_reload_recovers() {
    let h = Harness::new();
    let controller = h.controller("panic");
    controller.load("p1", &h.ctx).wait().unwrap();

    let err = controller.execute("p1", Payload::new(), &h.ctx).wait().unwrap_err();
    assert_eq!(err.failure_type(), Some(FailureType::ExecutingPlugin));
    assert_eq!(state(&h, &controller, "p1"), PluginState::Exception);

    let again = controller.execute("p1", Payload::new(), &h.ctx).wait();
    assert!(matches!(again, Err(PluginError::Execute(_))));

    controller.unload("p1", &h.ctx).wait().unwrap();
    assert_eq!(state(&h, &controller, "p1"), PluginState::Unloaded);

    controller.load("p1", &h.ctx).wait().unwrap();
    assert_eq!(state(&h, &controller, "p1"), PluginState::Loaded);
    assert_eq!(controller.binder().state(), ConnectionState::Bound);
}

#[test]
fn plugin_reported_transport_code_is_an_execute_error() {
    let h = Harness::new();
    let controller = h.controller("forge");
    controller.load("p1", &h.ctx).wait().unwrap();

    let err = controller.execute("p1", Payload::new(), &h.ctx).wait().unwrap_err();

    assert_eq!(
        err,
        PluginError::Execute(Failure::executing("forged"))
    );
    assert!(!err.is_retryable());
    assert_eq!(controller.binder().state(), ConnectionState::Bound);
}

#[test]
fn panicking_unload_hook_leaves_plugin_in_exception() {
    let h = Harness::new();
    let controller = h.controller("forge");
    controller.load("p1", &h.ctx).wait().unwrap();

    let err = controller.unload("p1", &h.ctx).wait().unwrap_err();

    assert_eq!(err.failure_type(), Some(FailureType::UnloadingPlugin));
    assert_eq!(state(&h, &controller, "p1"), PluginState::Exception);
    let again = controller.execute("p1", Payload::new(), &h.ctx).wait();
    assert!(matches!(again, Err(PluginError::Execute(f)) if f.code == FailureType::ExecutingPlugin));
}

#[test]
fn unload_of_unknown_plugin_is_unload_error() {
    let h = Harness::new();
    let controller = h.controller("echo");

    let err = controller.unload("ghost", &h.ctx).wait().unwrap_err();

    assert!(matches!(err, PluginError::Unload(f) if f.code == FailureType::UnloadingPlugin));
}

#[test]
fn load_of_unknown_entry_point_is_load_error() {
    let h = Harness::new();
    let controller = h.controller("nope");

    let err = controller.load("p1", &h.ctx).wait().unwrap_err();

    assert!(matches!(err, PluginError::Load(f) if f.code == FailureType::LoadingPlugin));
}

#[test]
fn teardown_resolves_every_call_exactly_once() {
    let h = Harness::new();
    let controller = h.controller("hold");
    let outcomes: Arc<Mutex<Vec<Result<Payload, PluginError>>>> = Arc::default();

    let names = ["p1", "p2", "p3", "p4"];
    for name in names {
        controller.load(name, &h.ctx).wait().unwrap();
    }
    for name in names {
        let outcomes = Arc::clone(&outcomes);
        controller.execute_with(name, Payload::new(), &h.ctx, move |result| {
            outcomes.lock().push(result);
        });
        h.wait_started();
    }
    assert_eq!(controller.pending(), names.len());

    controller.close();
    controller.close();
    h.release.add_permits(names.len());

    let deadline = Instant::now() + Duration::from_secs(2);
    while outcomes.lock().len() < names.len() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(100));

    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), names.len());
    for outcome in outcomes.iter() {
        assert_eq!(
            outcome,
            &Err(PluginError::ConnectionLost {
                worker_id: WORKER.into()
            })
        );
    }
    assert_eq!(controller.pending(), 0);
    assert_eq!(controller.binder().state(), ConnectionState::Unbound);
}

#[test]
fn completion_runs_on_the_callers_context() {
    let h = Harness::new();
    let controller = h.controller("echo");
    controller.load("p1", &h.ctx).wait().unwrap();
    let (tx, rx) = std::sync::mpsc::channel();

    let caller = thread::current().id();
    controller.execute_with("p1", Payload::new(), &h.ctx, move |result| {
        let _ = tx.send((result.is_ok(), thread::current().id() != caller));
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), (true, true));
}

#[test]
fn oversize_input_fails_before_dispatch() {
    let h = Harness::new();
    let controller = h.controller("echo");
    controller.load("p1", &h.ctx).wait().unwrap();

    let big = Payload::new().with("blob", "x".repeat(300 * 1024));
    let err = controller.execute("p1", big, &h.ctx).wait().unwrap_err();

    assert!(matches!(err, PluginError::PayloadTooLarge(_)));
    assert_eq!(controller.pending(), 0);
}

#[test]
fn controllers_for_one_worker_share_the_binding() {
    let h = Harness::new();
    let a = h.controller("echo");
    let b = h.controller("echo");

    a.load("p1", &h.ctx).wait().unwrap();
    let output = b.execute("p1", Payload::new(), &h.ctx).wait().unwrap();

    assert_eq!(output.get_str("plugin"), Some("p1"));
    assert_eq!(h.transport.binds(), 1);
}

#[test]
fn manager_shutdown_releases_every_binding() {
    let h = Harness::new();
    let controller = h.controller("echo");
    controller.load("p1", &h.ctx).wait().unwrap();

    h.manager.shutdown();

    assert_eq!(controller.binder().state(), ConnectionState::Unbound);
    assert!(h.manager.binder(WORKER).is_none());
    assert!(!h.transport.inner.is_bound(COMPONENT));
}

#[test]
fn strict_resolution_rejects_ambiguous_workers() {
    let transport = InProcessTransport::new().unwrap();
    let registry = StaticRegistry::from_endpoints([
        Endpoint::new(WORKER, "a"),
        Endpoint::new(WORKER, "b"),
    ]);
    let mut config = RuntimeConfig::default();
    config.binder.strict_resolution = true;
    let manager =
        PluginManager::with_registry(Arc::new(registry), Arc::new(transport), config).unwrap();

    let err = manager.create(descriptor(WORKER, "echo")).unwrap_err();

    assert!(matches!(
        err,
        ManagerError::ServiceNotFound {
            source: BindError::Resolution(ResolveError::Ambiguous { count: 2, .. }),
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_callers_await_completions() {
    let transport = InProcessTransport::new().unwrap();
    transport.register_worker(
        COMPONENT,
        Arc::new(enclave_sandbox::FactoryLoader::new().with_plugin("echo", || Echo)),
    );
    let mut config = RuntimeConfig::default();
    config.endpoints.push(Endpoint::new(WORKER, COMPONENT));
    let manager = PluginManager::from_config(config, Arc::new(transport)).unwrap();
    let controller = manager.create(descriptor(WORKER, "echo")).unwrap();
    let ctx = ExecutionContext::current().unwrap();

    let load = {
        let (controller, ctx) = (controller.clone(), ctx.clone());
        tokio::task::spawn_blocking(move || controller.load("p1", &ctx))
            .await
            .unwrap()
    };
    load.await.unwrap();

    let execute = {
        let (controller, ctx) = (controller.clone(), ctx.clone());
        tokio::task::spawn_blocking(move || {
            controller.execute("p1", Payload::new().with("op", "x"), &ctx)
        })
        .await
        .unwrap()
    };
    let output = execute.await.unwrap();

    assert_eq!(output.get_str("op"), Some("x"));
    manager.shutdown();
}
