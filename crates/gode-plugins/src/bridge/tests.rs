use super::*;
use crate::promise::PromiseState;
use crate::workers::WorkerPool;
use gode_kernel::plugin::Deferred;
use gode_kernel::{DetachedScope, ExportTable, OperationQueue};
use parking_lot::Mutex;
use std::time::Duration;

struct Fixture {
    queue: OperationQueue,
    context: BridgeContext,
    _pool: WorkerPool,
}

fn fixture() -> Fixture {
    let queue = OperationQueue::unbounded();
    let pool = WorkerPool::new(2).unwrap();
    let context = BridgeContext {
        sender: queue.sender(),
        promises: PromiseTable::new(queue.sender()),
        workers: pool.handle(),
    };
    Fixture {
        queue,
        context,
        _pool: pool,
    }
}

fn math_exports() -> ExportTable {
    ExportTable::new()
        .sync("add", [ParamKind::Int, ParamKind::Int], |args| {
            Ok(Value::Int(args[0].as_int().unwrap_or(0) + args[1].as_int().unwrap_or(0)))
        })
        .sync("explode", [], |_| panic!("boom"))
        .callback(
            "multiply_async",
            [ParamKind::Int, ParamKind::Int],
            |args, done| {
                let a = args[0].as_int().unwrap_or(0);
                let b = args[1].as_int().unwrap_or(0);
                std::thread::spawn(move || {
                    if a < 0 || b < 0 {
                        done.fail("negative operand");
                    } else {
                        done.succeed(a * b);
                    }
                });
                Ok(())
            },
        )
        .callback("twice", [], |_, done| {
            done.succeed(1);
            done.succeed(2);
            Ok(())
        })
        .promise("square", [ParamKind::Int], |args| {
            let n = args[0].as_int().unwrap_or(0);
            Ok(Deferred::new(move || Ok(Value::Int(n * n))))
        })
        .promise("refuse", [], |_| {
            Ok(Deferred::new(|| Err(NativeError::new("refused"))))
        })
        .sync("adder", [ParamKind::Int], |args| {
            let base = args[0].as_int().unwrap_or(0);
            Ok(Value::from(NativeFn::new("add_to", move |args| {
                Ok(Value::Int(base + args[0].as_int().unwrap_or(0)))
            })))
        })
}

fn install(fixture: &Fixture, guard: &Arc<ExportGuard>) -> PluginModule {
    install_exports("math", math_exports(), guard, &fixture.context, None).unwrap()
}

type Calls = Arc<Mutex<Vec<(Value, Value)>>>;

fn recorder(calls: &Calls) -> Value {
    let calls = calls.clone();
    Value::from(NativeFn::new("cb", move |mut args| {
        let value = args.pop().unwrap_or_default();
        let error = args.pop().unwrap_or_default();
        calls.lock().push((error, value));
        Ok(Value::Null)
    }))
}

#[test]
fn test_sync_export_coerces_arguments() {
    let fixture = fixture();
    let module = install(&fixture, &ExportGuard::new("math"));
    let add = module.get("add").unwrap();

    assert_eq!(add.call(vec![Value::Int(2), Value::Int(3)]).unwrap(), Value::Int(5));
    assert_eq!(add.call(vec![Value::Float(2.0), Value::Int(3)]).unwrap(), Value::Int(5));
    assert_eq!(add.script_arity(), 2);
}

#[test]
fn test_wrong_arguments_are_rejected_before_native_code() {
    let fixture = fixture();
    let module = install(&fixture, &ExportGuard::new("math"));
    let add = module.get("add").unwrap();

    let err = add.call(vec![Value::Int(1)]).unwrap_err();
    assert!(matches!(err, RuntimeBridgeError::Arity { expected: 2, actual: 1, .. }));

    let err = add.call(vec![Value::Int(1), Value::from("x")]).unwrap_err();
    assert!(matches!(
        err,
        RuntimeBridgeError::ArgumentType {
            index: 1,
            expected: ParamKind::Int,
            actual: "string",
            ..
        }
    ));

    let multiply = module.get("multiply_async").unwrap();
    let err = multiply
        .call(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeBridgeError::ArgumentType {
            index: 2,
            expected: ParamKind::Function,
            ..
        }
    ));
}

#[test]
fn test_native_panic_becomes_fault() {
    let fixture = fixture();
    let module = install(&fixture, &ExportGuard::new("math"));

    let err = module.get("explode").unwrap().call(vec![]).unwrap_err();
    assert!(matches!(err, RuntimeBridgeError::Fault { .. }));
    assert!(err.message().contains("boom"));
}

#[test]
fn test_callback_is_delivered_on_host_thread() {
    let mut fixture = fixture();
    let module = install(&fixture, &ExportGuard::new("math"));
    let calls: Calls = Arc::default();

    let returned = module
        .get("multiply_async")
        .unwrap()
        .call(vec![Value::Int(6), Value::Int(7), recorder(&calls)])
        .unwrap();
    assert_eq!(returned, Value::Null);
    assert!(calls.lock().is_empty());

    fixture.queue.run_until_idle(&mut DetachedScope);
    assert_eq!(*calls.lock(), vec![(Value::Null, Value::Int(42))]);
}

#[test]
fn test_callback_error_is_delivered_once() {
    let mut fixture = fixture();
    let module = install(&fixture, &ExportGuard::new("math"));
    let calls: Calls = Arc::default();

    module
        .get("multiply_async")
        .unwrap()
        .call(vec![Value::Int(-5), Value::Int(3), recorder(&calls)])
        .unwrap();
    fixture.queue.run_until_idle(&mut DetachedScope);

    let calls = calls.lock();
    assert_eq!(calls.len(), 1);
    let (error, value) = &calls[0];
    assert_eq!(value, &Value::Null);
    assert_eq!(error.get("message"), Some(&Value::from("negative operand")));
    assert_eq!(error.get("function"), Some(&Value::from("multiply_async")));
}

#[test]
fn test_second_completion_is_ignored() {
    let mut fixture = fixture();
    let module = install(&fixture, &ExportGuard::new("math"));
    let calls: Calls = Arc::default();

    module
        .get("twice")
        .unwrap()
        .call(vec![recorder(&calls)])
        .unwrap();
    fixture.queue.run_until_idle(&mut DetachedScope);

    assert_eq!(*calls.lock(), vec![(Value::Null, Value::Int(1))]);
}

#[test]
fn test_promise_export_settles_through_queue() {
    let mut fixture = fixture();
    let module = install(&fixture, &ExportGuard::new("math"));
    let promises = fixture.context.promises.clone();

    let Value::Promise(ok) = module.get("square").unwrap().call(vec![Value::Int(9)]).unwrap() else {
        panic!("expected a promise");
    };
    let Value::Promise(err) = module.get("refuse").unwrap().call(vec![]).unwrap() else {
        panic!("expected a promise");
    };
    assert_eq!(promises.state(ok), Some(PromiseState::Pending));

    fixture.queue.run_until_idle(&mut DetachedScope);

    assert_eq!(promises.state(ok), Some(PromiseState::Fulfilled(Value::Int(81))));
    match promises.state(err) {
        Some(PromiseState::Rejected(reason)) => {
            assert_eq!(reason.get("message"), Some(&Value::from("refused")));
        }
        other => panic!("unexpected state {:?}", other),
    }
}

#[test]
fn test_disposed_plugin_refuses_calls() {
    let fixture = fixture();
    let guard = ExportGuard::new("math");
    let module = install(&fixture, &guard);

    let adder = module.get("adder").unwrap().call(vec![Value::Int(10)]).unwrap();
    let Some(Callable::Native(add_to)) = adder.as_callable().cloned() else {
        panic!("expected a native function");
    };
    assert_eq!(add_to.call(vec![Value::Int(5)]).unwrap(), Value::Int(15));

    guard.mark_disposed();

    let err = module
        .get("add")
        .unwrap()
        .call(vec![Value::Int(1), Value::Int(2)])
        .unwrap_err();
    assert!(matches!(err, RuntimeBridgeError::PluginDisposed { .. }));
    assert!(add_to.call(vec![Value::Int(5)]).is_err());
}

#[test]
fn test_invalid_exports_install_nothing() {
    let fixture = fixture();
    let guard = ExportGuard::new("bad");

    let table = ExportTable::new()
        .sync("ok", [], |_| Ok(Value::Null))
        .sync("not-an-identifier", [], |_| Ok(Value::Null));
    let err = install_exports("bad", table, &guard, &fixture.context, None).unwrap_err();
    assert!(matches!(err, LoadError::InvalidExport { ref export, .. } if export == "not-an-identifier"));

    let table = ExportTable::new()
        .sync("same", [], |_| Ok(Value::Null))
        .sync("same", [], |_| Ok(Value::Null));
    assert!(install_exports("bad", table, &guard, &fixture.context, None).is_err());

    let table = ExportTable::new().callback("wide", [ParamKind::Any; 6], |_, _| Ok(()));
    assert!(install_exports("bad", table, &guard, &fixture.context, None).is_err());
}

#[test]
fn test_async_results_wait_for_workers() {
    let mut fixture = fixture();
    let table = ExportTable::new().promise("slow", [ParamKind::Int], |args| {
        let ms = args[0].as_int().unwrap_or(0) as u64;
        Ok(Deferred::new(move || {
            std::thread::sleep(Duration::from_millis(ms));
            Ok(Value::Int(ms as i64))
        }))
    });
    let module =
        install_exports("timing", table, &ExportGuard::new("timing"), &fixture.context, None)
            .unwrap();
    let promises = fixture.context.promises.clone();

    let order: Arc<Mutex<Vec<i64>>> = Arc::default();
    for ms in [200, 50] {
        let Value::Promise(id) = module.get("slow").unwrap().call(vec![Value::Int(ms)]).unwrap() else {
            panic!("expected a promise");
        };
        let order = order.clone();
        promises.then(
            id,
            Some(Callable::Native(NativeFn::new("record", move |args| {
                order.lock().push(args[0].as_int().unwrap_or(-1));
                Ok(Value::Null)
            }))),
            None,
        );
    }

    fixture.queue.run_until_idle(&mut DetachedScope);
    assert_eq!(*order.lock(), vec![50, 200]);
}
