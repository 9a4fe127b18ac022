//! Conversion between [`Value`] and Rhai's `Dynamic`.

use gode_kernel::{Callable, NativeFn, PromiseId, ScriptException, ScriptFunction, Value};
use gode_plugins::{PromiseState, PromiseTable};
use parking_lot::Mutex;
use rhai::{Array, Dynamic, EvalAltResult, FnPtr, Map, Position};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Engine handle stored inside a [`ScriptFunction`].
#[derive(Clone)]
pub struct RhaiFunction {
    pub fn_ptr: FnPtr,
    /// Source of the script that created the pointer; selects the AST the
    /// function is looked up in.
    pub source: Option<String>,
}

/// A promise as scripts see it.
///
/// Holds a handle on its record, so the table keeps the promise alive while
/// any script value refers to it.
pub struct PromiseRef {
    id: PromiseId,
    promises: PromiseTable,
}

impl PromiseRef {
    pub fn new(id: PromiseId, promises: PromiseTable) -> Self {
        promises.retain(id);
        Self { id, promises }
    }

    pub fn id(&self) -> PromiseId {
        self.id
    }

    /// Register reactions; returns the derived promise.
    pub fn then(&self, on_fulfilled: Option<Callable>, on_rejected: Option<Callable>) -> PromiseRef {
        let derived = self.promises.then(self.id, on_fulfilled, on_rejected);
        PromiseRef::new(derived, self.promises.clone())
    }

    pub fn state_name(&self) -> &'static str {
        match self.promises.state(self.id) {
            Some(PromiseState::Pending) => "pending",
            Some(PromiseState::Fulfilled(_)) => "fulfilled",
            Some(PromiseState::Rejected(_)) => "rejected",
            None => "unknown",
        }
    }
}

impl Clone for PromiseRef {
    fn clone(&self) -> Self {
        PromiseRef::new(self.id, self.promises.clone())
    }
}

impl Drop for PromiseRef {
    fn drop(&mut self) {
        self.promises.release(self.id);
    }
}

impl fmt::Display for PromiseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.id, self.state_name())
    }
}

/// Converts values in both directions.
#[derive(Clone)]
pub struct Marshal {
    promises: PromiseTable,
    /// Sources of the script callbacks currently running, innermost last
    callers: Arc<Mutex<Vec<Option<String>>>>,
}

impl Marshal {
    pub fn new(promises: PromiseTable) -> Self {
        Self {
            promises,
            callers: Arc::default(),
        }
    }

    pub fn promises(&self) -> &PromiseTable {
        &self.promises
    }

    /// Source of the script making the current call.
    ///
    /// `call_source` is what the engine reports for the caller. Code running
    /// inside a callback has no engine source, so the callback's own source
    /// is used instead.
    pub fn caller_source(&self, call_source: Option<&str>) -> Option<String> {
        match call_source {
            Some(source) => Some(source.to_string()),
            None => self.callers.lock().last().cloned().flatten(),
        }
    }

    /// Run `f` with `source` recorded as the running callback's script.
    pub fn with_caller<R>(&self, source: Option<&str>, f: impl FnOnce() -> R) -> R {
        self.callers.lock().push(source.map(String::from));
        let result = f();
        self.callers.lock().pop();
        result
    }

    pub fn to_dynamic(&self, value: Value) -> Dynamic {
        match value {
            Value::Null => Dynamic::UNIT,
            Value::Bool(b) => Dynamic::from(b),
            Value::Int(i) => Dynamic::from(i),
            Value::Float(f) => Dynamic::from(f),
            Value::String(s) => Dynamic::from(s),
            Value::Array(items) => {
                let array: Array = items.into_iter().map(|v| self.to_dynamic(v)).collect();
                Dynamic::from(array)
            }
            Value::Map(entries) => {
                let map: Map = entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), self.to_dynamic(v)))
                    .collect();
                Dynamic::from(map)
            }
            Value::Function(Callable::Native(function)) => Dynamic::from(function),
            Value::Function(Callable::Script(function)) => {
                match function.downcast_ref::<RhaiFunction>() {
                    Some(handle) => Dynamic::from(handle.fn_ptr.clone()),
                    None => {
                        warn!(function = function.name(), "foreign script function dropped");
                        Dynamic::UNIT
                    }
                }
            }
            Value::Promise(id) => Dynamic::from(PromiseRef::new(id, self.promises.clone())),
        }
    }

    /// `source` is the script the value comes from; function pointers keep
    /// it so they can be called back later.
    pub fn from_dynamic(&self, value: Dynamic, source: Option<&str>) -> Value {
        // Captured variables arrive as shared cells.
        let value = value.flatten();
        if value.is_unit() {
            return Value::Null;
        }
        if let Ok(b) = value.as_bool() {
            return Value::Bool(b);
        }
        if let Ok(i) = value.as_int() {
            return Value::Int(i);
        }
        if let Ok(f) = value.as_float() {
            return Value::Float(f);
        }
        if let Ok(c) = value.as_char() {
            return Value::String(c.to_string());
        }
        if value.is_string() {
            return value.into_string().map(Value::String).unwrap_or_default();
        }
        if value.is_array() {
            return value
                .into_array()
                .map(|items| {
                    Value::Array(
                        items
                            .into_iter()
                            .map(|v| self.from_dynamic(v, source))
                            .collect(),
                    )
                })
                .unwrap_or_default();
        }
        if value.is_map() {
            return value
                .try_cast::<Map>()
                .map(|map| {
                    Value::Map(
                        map.into_iter()
                            .map(|(k, v)| (k.to_string(), self.from_dynamic(v, source)))
                            .collect(),
                    )
                })
                .unwrap_or_default();
        }
        if value.is::<FnPtr>() {
            return value
                .try_cast::<FnPtr>()
                .map(|fn_ptr| Value::Function(script_callable(fn_ptr, source)))
                .unwrap_or_default();
        }
        if value.is::<NativeFn>() {
            return value
                .try_cast::<NativeFn>()
                .map(|f| Value::Function(Callable::Native(f)))
                .unwrap_or_default();
        }
        if value.is::<PromiseRef>() {
            return value
                .try_cast::<PromiseRef>()
                .map(|p| Value::Promise(p.id))
                .unwrap_or_default();
        }
        Value::String(value.to_string())
    }

    /// Raise `value` as a script exception.
    pub fn throw(&self, value: Value) -> Box<EvalAltResult> {
        Box::new(EvalAltResult::ErrorRuntime(
            self.to_dynamic(value),
            Position::NONE,
        ))
    }

    /// The exception a Rhai error represents.
    pub fn exception(&self, err: &EvalAltResult) -> ScriptException {
        match err {
            EvalAltResult::ErrorRuntime(value, _) => {
                exception_from_value(self.from_dynamic(value.clone(), None))
            }
            EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => self.exception(inner),
            other => ScriptException::new(other.to_string()),
        }
    }
}

/// Wrap a Rhai function pointer as a host callable.
pub fn script_callable(fn_ptr: FnPtr, source: Option<&str>) -> Callable {
    let name = fn_ptr.fn_name().to_string();
    Callable::Script(ScriptFunction::new(
        &name,
        RhaiFunction {
            fn_ptr,
            source: source.map(String::from),
        },
    ))
}

/// Rebuild bridge exceptions (maps with `message`/`plugin`/`function`).
fn exception_from_value(value: Value) -> ScriptException {
    let text = |key: &str| value.get(key).and_then(Value::as_str).map(String::from);
    match text("message") {
        Some(message) => ScriptException {
            message,
            plugin: text("plugin"),
            function: text("function"),
            thrown: Some(value.clone()),
        },
        None => ScriptException::thrown(value),
    }
}
