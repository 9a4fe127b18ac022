use super::*;
use crate::queue::OperationQueue;
use crate::scope::DetachedScope;
use std::sync::atomic::AtomicBool;

struct Counter {
    capability: Option<HostCapability>,
    disposed: Arc<AtomicBool>,
}

impl NativePlugin for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn initialize(&mut self, capability: HostCapability) -> Result<(), NativeError> {
        self.capability = Some(capability);
        Ok(())
    }

    fn exports(&self) -> ExportTable {
        ExportTable::new()
            .sync("inc", [ParamKind::Int], |args| {
                Ok(Value::Int(args[0].as_int().unwrap_or(0) + 1))
            })
            .callback("later", [], |_, done| {
                done.succeed(1);
                Ok(())
            })
            .promise("deferred", [], |_| Ok(Deferred::resolved("ok")))
    }

    fn dispose(&mut self) -> Result<(), NativeError> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_export_table_records_shapes() {
    let plugin = Counter {
        capability: None,
        disposed: Arc::default(),
    };
    let table = plugin.exports();

    assert_eq!(table.names(), vec!["inc", "later", "deferred"]);
    let kinds: Vec<ExportKind> = table.iter().map(Export::kind).collect();
    assert_eq!(
        kinds,
        vec![
            ExportKind::Sync,
            ExportKind::CallbackAsync,
            ExportKind::PromiseReturning
        ]
    );
    assert_eq!(table.iter().next().map(Export::arity), Some(1));
}

#[test]
fn test_plugin_lifecycle_through_trait() {
    let mut queue = OperationQueue::unbounded();
    let disposed = Arc::new(AtomicBool::new(false));
    let mut plugin = Counter {
        capability: None,
        disposed: disposed.clone(),
    };

    plugin
        .initialize(HostCapability::new(queue.sender(), "plugin:counter"))
        .unwrap();
    let capability = plugin.capability.clone().unwrap();
    let seen = Arc::new(AtomicBool::new(false));
    let flag = seen.clone();
    capability.submit(move || flag.store(true, Ordering::SeqCst));
    queue.drain(&mut DetachedScope);
    assert!(seen.load(Ordering::SeqCst));

    plugin.dispose().unwrap();
    assert!(disposed.load(Ordering::SeqCst));
}

#[test]
fn test_completion_delivers_only_once() {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let completion = Completion::new("math.add_async", move |result| sink.lock().push(result));

    let clone = completion.clone();
    assert!(completion.succeed(30));
    assert!(!clone.fail("late error"));
    assert!(!completion.succeed(31));

    assert_eq!(*delivered.lock(), vec![Ok(Value::Int(30))]);
    assert_eq!(completion.duplicate_calls(), 2);
    assert!(clone.is_completed());
}

#[test]
fn test_dropped_completion_reports_failure() {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let completion = Completion::new("abandoned", move |result| sink.lock().push(result));

    let worker_copy = completion.clone();
    drop(completion);
    assert!(delivered.lock().is_empty());
    std::thread::spawn(move || drop(worker_copy)).join().unwrap();

    let delivered = delivered.lock();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].is_err());
}

#[test]
fn test_deferred_runs_job() {
    assert_eq!(Deferred::resolved(5).run(), Ok(Value::Int(5)));
    assert_eq!(
        Deferred::rejected("nope").run(),
        Err(NativeError::new("nope"))
    );
    assert_eq!(Deferred::new(|| Ok(Value::Bool(true))).run(), Ok(Value::Bool(true)));
}

#[test]
fn test_state_transitions() {
    use PluginState::*;

    assert!(Discovered.can_transition_to(Loaded));
    assert!(Loaded.can_transition_to(Initialized));
    assert!(Initialized.can_transition_to(Active));
    assert!(Active.can_transition_to(Disposed));
    assert!(Loaded.can_transition_to(Disposed));

    assert!(!Discovered.can_transition_to(Active));
    assert!(!Loaded.can_transition_to(Active));
    assert!(!Disposed.can_transition_to(Loaded));
    assert!(!Disposed.can_transition_to(Disposed));
    assert!(!Active.can_transition_to(Initialized));

    assert!(Active.needs_dispose());
    assert!(!Loaded.needs_dispose());
    assert!(Disposed.is_terminal());
}

#[test]
fn test_symbol_list_is_complete() {
    assert_eq!(symbols::REQUIRED.len(), 6);
    assert!(!symbols::REQUIRED.contains(&symbols::API_VERSION));
}
