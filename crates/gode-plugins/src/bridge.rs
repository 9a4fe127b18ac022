//! Plugin bridge
//!
//! Wraps each export as a [`BridgedFunction`]: a script-callable that checks
//! arguments against the export's signature, catches native faults, and routes
//! every asynchronous completion through the operation queue.

use crate::loader::PluginLibrary;
use crate::promise::{PromiseTable, invoke_callable};
use crate::workers::WorkerHandle;
use gode_kernel::plugin::{Export, ExportKind, ExportedFunction, fault_from_panic};
use gode_kernel::{
    Callable, Completion, LoadError, NativeError, NativeFn, OperationError, ParamKind,
    QueueSender, RuntimeBridgeError, ScriptException, Value,
};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Most parameters a script may pass to one export, callback included.
pub const MAX_SCRIPT_ARITY: usize = 6;

/// Shared by all exports of one plugin; flipped when the plugin is disposed.
#[derive(Debug)]
pub struct ExportGuard {
    plugin: String,
    disposed: AtomicBool,
}

impl ExportGuard {
    pub fn new(plugin: &str) -> Arc<Self> {
        Arc::new(Self {
            plugin: plugin.to_string(),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn mark_disposed(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }
}

/// Host services the bridge hands work to.
#[derive(Clone)]
pub struct BridgeContext {
    pub sender: QueueSender,
    pub promises: PromiseTable,
    pub workers: WorkerHandle,
}

/// A plugin export wrapped for the script engine.
pub struct BridgedFunction {
    // Declared first so the plugin's closure drops before the library.
    function: ExportedFunction,
    plugin: Arc<str>,
    name: Arc<str>,
    signature: Arc<[ParamKind]>,
    guard: Arc<ExportGuard>,
    context: BridgeContext,
    library: Option<Arc<PluginLibrary>>,
}

impl BridgedFunction {
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExportKind {
        self.function.kind()
    }

    pub fn signature(&self) -> &[ParamKind] {
        &self.signature
    }

    /// Number of arguments the script passes, trailing callback included.
    pub fn script_arity(&self) -> usize {
        match self.kind() {
            ExportKind::CallbackAsync => self.signature.len() + 1,
            _ => self.signature.len(),
        }
    }

    fn error_native(&self, message: String) -> RuntimeBridgeError {
        RuntimeBridgeError::Native {
            plugin: self.plugin.to_string(),
            function: self.name.to_string(),
            message,
        }
    }

    fn error_fault(&self, message: String) -> RuntimeBridgeError {
        RuntimeBridgeError::Fault {
            plugin: self.plugin.to_string(),
            function: self.name.to_string(),
            message,
        }
    }

    fn label(&self) -> String {
        format!("{}.{}", self.plugin, self.name)
    }

    /// Invoke from the host thread.
    ///
    /// Errors returned here are synchronous: wrong arguments, a disposed
    /// plugin, or a failing sync export. Failures of async exports travel
    /// through their callback or promise instead.
    pub fn call(&self, mut args: Vec<Value>) -> Result<Value, RuntimeBridgeError> {
        if self.guard.is_disposed() {
            return Err(RuntimeBridgeError::PluginDisposed {
                plugin: self.plugin.to_string(),
                function: self.name.to_string(),
            });
        }
        if args.len() != self.script_arity() {
            return Err(RuntimeBridgeError::Arity {
                plugin: self.plugin.to_string(),
                function: self.name.to_string(),
                expected: self.script_arity(),
                actual: args.len(),
            });
        }

        match &self.function {
            ExportedFunction::Sync(f) => {
                let args = self.coerce(args)?;
                match panic::catch_unwind(AssertUnwindSafe(|| f(args))) {
                    Ok(Ok(value)) => Ok(self.protect(value)),
                    Ok(Err(err)) => Err(self.error_native(err.message)),
                    Err(payload) => Err(self.error_fault(fault_from_panic(payload.as_ref()).message)),
                }
            }
            ExportedFunction::CallbackAsync(f) => {
                let callback = match args.pop() {
                    Some(Value::Function(callable)) => callable,
                    other => {
                        return Err(RuntimeBridgeError::ArgumentType {
                            plugin: self.plugin.to_string(),
                            function: self.name.to_string(),
                            index: self.signature.len(),
                            expected: ParamKind::Function,
                            actual: other.as_ref().map_or("nothing", Value::type_name),
                        });
                    }
                };
                let args = self.coerce(args)?;
                let completion = self.completion_for(callback);

                let dispatched = panic::catch_unwind(AssertUnwindSafe(|| f(args, completion.clone())));
                match dispatched {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        completion.fail(err);
                    }
                    Err(payload) => {
                        completion.fail(fault_from_panic(payload.as_ref()));
                    }
                }
                Ok(Value::Null)
            }
            ExportedFunction::PromiseReturning(f) => {
                let args = self.coerce(args)?;
                let promise = self.context.promises.create();

                let started = panic::catch_unwind(AssertUnwindSafe(|| f(args)));
                let deferred = match started {
                    Ok(Ok(deferred)) => deferred,
                    Ok(Err(err)) => {
                        self.context
                            .promises
                            .settle_later(promise, Err(self.rejection(err)), None);
                        return Ok(Value::Promise(promise));
                    }
                    Err(payload) => {
                        let err = fault_from_panic(payload.as_ref());
                        self.context
                            .promises
                            .settle_later(promise, Err(self.rejection(err)), None);
                        return Ok(Value::Promise(promise));
                    }
                };

                let ticket = self.context.sender.ticket();
                let promises = self.context.promises.clone();
                let protector = self.protector();
                let spawned = self.context.workers.spawn_blocking(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(move || deferred.run()))
                        .unwrap_or_else(|payload| Err(fault_from_panic(payload.as_ref())));
                    let outcome = protector.wrap(outcome);
                    if !promises.settle_later(promise, outcome, Some(ticket)) {
                        debug!(promise = %promise, "host gone, dropping settlement");
                    }
                });
                if !spawned {
                    warn!(function = %self.label(), "worker pool closed, promise will not settle");
                }
                Ok(Value::Promise(promise))
            }
        }
    }

    fn coerce(&self, args: Vec<Value>) -> Result<Vec<Value>, RuntimeBridgeError> {
        args.into_iter()
            .zip(self.signature.iter())
            .enumerate()
            .map(|(index, (value, kind))| {
                kind.coerce(value)
                    .map_err(|original| RuntimeBridgeError::ArgumentType {
                        plugin: self.plugin.to_string(),
                        function: self.name.to_string(),
                        index,
                        expected: *kind,
                        actual: original.type_name(),
                    })
            })
            .collect()
    }

    fn rejection(&self, err: NativeError) -> Value {
        rejection_value(&self.plugin, &self.name, err)
    }

    /// Build the completion handed to a callback export. Delivery is queued;
    /// the script callback receives `(error, value)`.
    fn completion_for(&self, callback: Callable) -> Completion {
        let sender = self.context.sender.clone();
        let ticket = sender.ticket();
        let protector = self.protector();
        let label = self.label();

        Completion::new(label.clone(), move |result| {
            let args = match protector.wrap(result) {
                Ok(value) => vec![Value::Null, value],
                Err(error) => vec![error, Value::Null],
            };
            sender.submit(label, move |scope| {
                let _ticket = ticket;
                invoke_callable(scope, &callback, args)
                    .map(|_| ())
                    .map_err(OperationError::from)
            });
        })
    }
}

impl BridgedFunction {
    fn protector(&self) -> Protector {
        Protector {
            plugin: self.plugin.clone(),
            function: self.name.clone(),
            guard: self.guard.clone(),
            library: self.library.clone(),
        }
    }

    fn protect(&self, value: Value) -> Value {
        self.protector().protect(value)
    }
}

/// Re-wraps values coming out of a plugin.
///
/// Native callables returned by a plugin are guarded so that calling them
/// after disposal fails cleanly, and they keep the library mapped.
#[derive(Clone)]
struct Protector {
    plugin: Arc<str>,
    function: Arc<str>,
    guard: Arc<ExportGuard>,
    library: Option<Arc<PluginLibrary>>,
}

impl Protector {
    /// Protect a successful outcome; turn a failure into its script value.
    fn wrap(&self, outcome: Result<Value, NativeError>) -> Result<Value, Value> {
        match outcome {
            Ok(value) => Ok(self.protect(value)),
            Err(err) => Err(rejection_value(&self.plugin, &self.function, err)),
        }
    }

    fn protect(&self, value: Value) -> Value {
        match value {
            Value::Function(Callable::Native(inner)) => {
                let guard = self.guard.clone();
                let library = self.library.clone();
                let name = inner.name().to_string();
                Value::from(NativeFn::new(&name, move |args| {
                    let _mapped = &library;
                    if guard.is_disposed() {
                        return Err(NativeError::new(format!(
                            "plugin '{}' disposed",
                            guard.plugin()
                        )));
                    }
                    panic::catch_unwind(AssertUnwindSafe(|| inner.call(args)))
                        .unwrap_or_else(|payload| Err(fault_from_panic(payload.as_ref())))
                }))
            }
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.protect(v)).collect()),
            Value::Map(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, self.protect(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl fmt::Debug for BridgedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgedFunction")
            .field("plugin", &self.plugin)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("signature", &self.signature)
            .finish()
    }
}

/// The value a script sees for a failed async export.
pub fn rejection_value(plugin: &str, function: &str, err: NativeError) -> Value {
    ScriptException::from(RuntimeBridgeError::Native {
        plugin: plugin.to_string(),
        function: function.to_string(),
        message: err.message,
    })
    .to_value()
}

/// All exports of one plugin, as installed in the script namespace.
#[derive(Debug)]
pub struct PluginModule {
    pub plugin: String,
    pub functions: BTreeMap<String, Arc<BridgedFunction>>,
}

impl PluginModule {
    pub fn get(&self, name: &str) -> Option<&Arc<BridgedFunction>> {
        self.functions.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.functions.keys().map(String::as_str).collect()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate an export table and wrap every entry.
///
/// Names must be identifiers and unique; arities must fit the engine. Nothing
/// is installed when any export is invalid.
pub fn install_exports(
    plugin: &str,
    exports: impl IntoIterator<Item = Export>,
    guard: &Arc<ExportGuard>,
    context: &BridgeContext,
    library: Option<&Arc<PluginLibrary>>,
) -> Result<PluginModule, LoadError> {
    let invalid = |export: &str, reason: String| LoadError::InvalidExport {
        plugin: plugin.to_string(),
        export: export.to_string(),
        reason,
    };

    let mut seen = HashSet::new();
    let mut functions = BTreeMap::new();
    let plugin_name: Arc<str> = Arc::from(plugin);

    for export in exports {
        if !is_identifier(&export.name) {
            return Err(invalid(&export.name, "name is not an identifier".to_string()));
        }
        if !seen.insert(export.name.clone()) {
            return Err(invalid(&export.name, "exported twice".to_string()));
        }
        let script_arity = match export.kind() {
            ExportKind::CallbackAsync => export.arity() + 1,
            _ => export.arity(),
        };
        if script_arity > MAX_SCRIPT_ARITY {
            return Err(invalid(
                &export.name,
                format!("{} parameters, at most {} supported", script_arity, MAX_SCRIPT_ARITY),
            ));
        }

        debug!(plugin, export = %export.name, kind = %export.kind(), "installing export");
        let bridged = BridgedFunction {
            function: export.function,
            plugin: plugin_name.clone(),
            name: Arc::from(export.name.as_str()),
            signature: Arc::from(export.signature),
            guard: guard.clone(),
            context: context.clone(),
            library: library.cloned(),
        };
        functions.insert(export.name, Arc::new(bridged));
    }

    Ok(PluginModule {
        plugin: plugin.to_string(),
        functions,
    })
}

#[cfg(test)]
mod tests;
