//! Host-provided `gode:*` modules.

use gode_kernel::{Callable, NativeError, NativeFn, OperationError, QueueSender, Value};
use gode_plugins::{WorkerHandle, invoke_callable};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// One function of a built-in module.
#[derive(Debug, Clone)]
pub struct BuiltinFunction {
    pub name: String,
    pub arity: usize,
    pub function: NativeFn,
}

/// A built-in module: a named set of native functions.
#[derive(Debug, Clone, Default)]
pub struct BuiltinModule {
    functions: Vec<BuiltinFunction>,
}

impl BuiltinModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function<F>(mut self, name: &str, arity: usize, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, NativeError> + Send + Sync + 'static,
    {
        self.functions.push(BuiltinFunction {
            name: name.to_string(),
            arity,
            function: NativeFn::new(name, f),
        });
        self
    }

    pub fn functions(&self) -> &[BuiltinFunction] {
        &self.functions
    }

    pub fn get(&self, name: &str) -> Option<&BuiltinFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// Built-in modules by full specifier (`gode:core`).
#[derive(Debug, Clone, Default)]
pub struct BuiltinRegistry {
    modules: BTreeMap<String, BuiltinModule>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `gode:core` and `gode:timers`.
    pub fn with_defaults(sender: QueueSender, workers: WorkerHandle) -> Self {
        let mut registry = Self::new();
        registry.register("gode:core", core_module());
        registry.register("gode:timers", timers_module(sender, workers));
        registry
    }

    pub fn register(&mut self, specifier: &str, module: BuiltinModule) {
        self.modules.insert(specifier.to_string(), module);
    }

    pub fn get(&self, specifier: &str) -> Option<&BuiltinModule> {
        self.modules.get(specifier)
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.keys().map(String::as_str).collect()
    }
}

fn core_module() -> BuiltinModule {
    BuiltinModule::new()
        .function("version", 0, |_| Ok(Value::from(env!("CARGO_PKG_VERSION"))))
        .function("platform", 0, |_| Ok(Value::from(std::env::consts::OS)))
        .function("arch", 0, |_| Ok(Value::from(std::env::consts::ARCH)))
}

fn timers_module(sender: QueueSender, workers: WorkerHandle) -> BuiltinModule {
    BuiltinModule::new().function("set_timeout", 2, move |args| {
        let ms = args
            .first()
            .and_then(Value::as_int)
            .ok_or_else(|| NativeError::new("set_timeout expects a delay in milliseconds"))?;
        let callback: Callable = args
            .get(1)
            .and_then(Value::as_callable)
            .cloned()
            .ok_or_else(|| NativeError::new("set_timeout expects a function"))?;

        let delay = Duration::from_millis(ms.max(0) as u64);
        let ticket = sender.ticket();
        let sender = sender.clone();
        let scheduled = workers.spawn_after(delay, move || {
            sender.submit("gode:timers", move |scope| {
                let _ticket = ticket;
                invoke_callable(scope, &callback, Vec::new())
                    .map(|_| ())
                    .map_err(OperationError::from)
            });
        });
        if !scheduled {
            debug!("timer dropped, worker pool closed");
        }
        Ok(Value::Null)
    })
}
