//! Plugin lifecycle scenarios: disposal order, failed initialization and
//! async completion ordering.

use gode_kernel::{
    Callable, Completion, DetachedScope, ExportTable, HostCapability, NativeError, NativeFn,
    NativePlugin, OperationQueue, ParamKind, PluginState, Value,
};
use gode_plugins::{PluginError, PluginManager};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;

struct Recorder {
    name: &'static str,
    fail_dispose: bool,
    fail_init: bool,
    log: Log,
}

impl Recorder {
    fn boxed(name: &'static str, log: &Log) -> Box<Self> {
        Box::new(Self {
            name,
            fail_dispose: false,
            fail_init: false,
            log: log.clone(),
        })
    }
}

impl NativePlugin for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn initialize(&mut self, _: HostCapability) -> Result<(), NativeError> {
        if self.fail_init {
            return Err(NativeError::new("missing configuration"));
        }
        Ok(())
    }

    fn exports(&self) -> ExportTable {
        let name = self.name;
        ExportTable::new().sync("hello", [], move |_| Ok(Value::from(name)))
    }

    fn dispose(&mut self) -> Result<(), NativeError> {
        self.log.lock().push(self.name.to_string());
        if self.fail_dispose {
            return Err(NativeError::new("still busy"));
        }
        Ok(())
    }
}

#[test]
fn test_disposal_runs_in_reverse_and_collects_failures() {
    let queue = OperationQueue::unbounded();
    let mut manager = PluginManager::new(queue.sender(), 1).unwrap();
    let log: Log = Arc::default();

    manager.activate_static(Recorder::boxed("a", &log)).unwrap();
    manager
        .activate_static(Box::new(Recorder {
            name: "b",
            fail_dispose: true,
            fail_init: false,
            log: log.clone(),
        }))
        .unwrap();
    manager.activate_static(Recorder::boxed("c", &log)).unwrap();

    let report = manager.dispose_all();

    assert_eq!(*log.lock(), vec!["c", "b", "a"]);
    assert_eq!(report.failed_plugins(), vec!["b"]);
    assert_eq!(report.failures[0].message, "still busy");
    assert!(
        manager
            .descriptors()
            .iter()
            .all(|d| d.state == PluginState::Disposed)
    );
}

#[test]
fn test_failed_initialize_leaves_other_plugins_available() {
    let queue = OperationQueue::unbounded();
    let mut manager = PluginManager::new(queue.sender(), 1).unwrap();
    let log: Log = Arc::default();

    manager.activate_static(Recorder::boxed("good", &log)).unwrap();
    let err = manager
        .activate_static(Box::new(Recorder {
            name: "bad",
            fail_dispose: false,
            fail_init: true,
            log: log.clone(),
        }))
        .unwrap_err();

    assert!(matches!(err, PluginError::Initialization(ref e) if e.plugin == "bad"));
    let namespace = manager.namespace();
    assert!(namespace.contains_key("good"));
    assert!(!namespace.contains_key("bad"));
    assert_eq!(
        manager.call("good", "hello", vec![]).unwrap(),
        Value::from("good")
    );
    assert!(matches!(
        manager.call("bad", "hello", vec![]),
        Err(PluginError::NotFound(_))
    ));

    let report = manager.dispose_all();
    assert!(report.is_clean());
    assert_eq!(*log.lock(), vec!["good"]);
}

struct Delays;

impl NativePlugin for Delays {
    fn name(&self) -> &str {
        "delays"
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn initialize(&mut self, _: HostCapability) -> Result<(), NativeError> {
        Ok(())
    }

    fn exports(&self) -> ExportTable {
        ExportTable::new().callback(
            "add_after",
            [ParamKind::Int, ParamKind::Int, ParamKind::Int],
            |args, done: Completion| {
                let (a, b, ms) = (
                    args[0].as_int().unwrap_or(0),
                    args[1].as_int().unwrap_or(0),
                    args[2].as_int().unwrap_or(0) as u64,
                );
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(ms));
                    done.succeed(a + b);
                });
                Ok(())
            },
        )
    }
}

#[test]
fn test_async_completions_follow_elapsed_time() {
    let mut queue = OperationQueue::unbounded();
    let mut manager = PluginManager::new(queue.sender(), 2).unwrap();
    manager.activate_static(Box::new(Delays)).unwrap();

    let seen: Arc<Mutex<Vec<(Value, Value)>>> = Arc::default();
    let callback = || {
        let seen = seen.clone();
        Value::Function(Callable::Native(NativeFn::new("cb", move |args| {
            seen.lock().push((args[0].clone(), args[1].clone()));
            Ok(Value::Null)
        })))
    };

    manager
        .call(
            "delays",
            "add_after",
            vec![Value::Int(10), Value::Int(20), Value::Int(200), callback()],
        )
        .unwrap();
    manager
        .call(
            "delays",
            "add_after",
            vec![Value::Int(1), Value::Int(1), Value::Int(50), callback()],
        )
        .unwrap();

    queue.run_until_idle(&mut DetachedScope);

    assert_eq!(
        *seen.lock(),
        vec![
            (Value::Null, Value::Int(2)),
            (Value::Null, Value::Int(30)),
        ]
    );
    assert!(manager.dispose_all().is_clean());
}

#[test]
fn test_missing_library_is_a_load_error() {
    let queue = OperationQueue::unbounded();
    let mut manager = PluginManager::new(queue.sender(), 1).unwrap();
    let dir = tempfile::tempdir().unwrap();

    let err = manager
        .activate_path(dir.path().join("libnothing.so"))
        .unwrap_err();
    assert!(matches!(err, PluginError::Load(_)));
    assert!(manager.descriptors().is_empty());
}
