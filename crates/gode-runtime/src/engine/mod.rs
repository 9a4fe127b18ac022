//! Rhai 引擎适配层
//! Rhai engine adapter
//!
//! Owns the `rhai::Engine`, routes `import` through [`HostModules`], exposes
//! promises and native functions as script types, and implements
//! [`HostScope`] so queued operations can call back into scripts.

mod marshal;
mod modules;

pub use marshal::{Marshal, PromiseRef, RhaiFunction, script_callable};
pub use modules::{
    HostModules, HostState, MAX_EXPORT_ARITY, PLUGIN_NAMESPACE, SharedState, builtin_module,
    plugin_module,
};

use crate::error::HostError;
use gode_kernel::{HostScope, NativeFn, ScriptException, ScriptFunction, Value};
use parking_lot::Mutex;
use rhai::{AST, Dynamic, Engine, EvalAltResult, FnPtr, INT, NativeCallContext, Scope};
use std::sync::Arc;
use tracing::{debug, info};

type RhaiResult = Result<Dynamic, Box<EvalAltResult>>;

/// Receives each printed line as it is produced.
pub type OutputSink = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Output {
    lines: Vec<String>,
    sink: Option<OutputSink>,
}

impl Output {
    fn push(&mut self, line: &str) {
        if let Some(sink) = &self.sink {
            sink(line);
        }
        self.lines.push(line.to_string());
    }
}

/// Rhai 引擎
/// The engine the host drives
pub struct RhaiEngine {
    engine: Engine,
    scope: Scope<'static>,
    state: SharedState,
    marshal: Marshal,
    output: Arc<Mutex<Output>>,
}

impl RhaiEngine {
    pub fn new(state: SharedState, marshal: Marshal) -> Self {
        let mut engine = Engine::new();
        engine.set_module_resolver(HostModules::new(state.clone(), marshal.clone()));

        let output: Arc<Mutex<Output>> = Arc::default();
        {
            let output = output.clone();
            engine.on_print(move |text| {
                info!(target: "gode::script", "{}", text);
                output.lock().push(text);
            });
        }
        {
            let output = output.clone();
            engine.on_debug(move |text, source, pos| {
                debug!(target: "gode::script", source = source.unwrap_or(""), line = ?pos.line(), "{}", text);
                output.lock().push(text);
            });
        }

        register_promise_type(&mut engine, &marshal);
        register_native_fn_type(&mut engine, &marshal);

        Self {
            engine,
            scope: Scope::new(),
            state,
            marshal,
            output,
        }
    }

    pub fn marshal(&self) -> &Marshal {
        &self.marshal
    }

    /// Lines printed by scripts so far.
    pub fn output(&self) -> Vec<String> {
        self.output.lock().lines.clone()
    }

    /// Forward printed lines to `sink` as well as buffering them.
    pub fn set_output_sink(&mut self, sink: OutputSink) {
        self.output.lock().sink = Some(sink);
    }

    /// 执行脚本
    /// Evaluate `script` as the top-level module named `source_name`
    ///
    /// Top-level variables persist between calls. An empty name marks inline
    /// code; its imports resolve against the base directory.
    pub fn eval(&mut self, source_name: &str, script: &str) -> Result<Value, HostError> {
        let mut ast = self
            .engine
            .compile(script)
            .map_err(|err| HostError::Compile {
                source_name: display_name(source_name).to_string(),
                message: err.to_string(),
            })?;
        if !source_name.is_empty() {
            ast.set_source(source_name);
        }
        let ast = Arc::new(ast);
        {
            let mut state = self.state.lock();
            // Callbacks from earlier evaluations of the same source stay callable.
            let lookup = match state.asts.get(source_name) {
                Some(previous) => Arc::new(previous.merge(&ast)),
                None => ast.clone(),
            };
            state.asts.insert(source_name.to_string(), lookup);
            state.import_error = None;
            if !source_name.is_empty() {
                state.loading.push(source_name.to_string());
            }
        }

        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut self.scope, &ast);

        let import_error = {
            let mut state = self.state.lock();
            state.loading.clear();
            state.import_error.take()
        };
        match result {
            Ok(value) => Ok(self.marshal.from_dynamic(value, Some(source_name))),
            Err(err) => match import_error {
                Some(import_error) if is_import_failure(&err) => Err(import_error),
                _ => Err(HostError::Script(self.marshal.exception(&err))),
            },
        }
    }
}

impl HostScope for RhaiEngine {
    fn call_function(
        &mut self,
        function: &ScriptFunction,
        args: Vec<Value>,
    ) -> Result<Value, ScriptException> {
        let handle = function.downcast_ref::<RhaiFunction>().ok_or_else(|| {
            ScriptException::new(format!("'{}' was not created by this engine", function.name()))
        })?;
        let ast = self
            .state
            .lock()
            .asts
            .get(handle.source.as_deref().unwrap_or(""))
            .cloned()
            .unwrap_or_else(|| Arc::new(AST::empty()));

        let args: Vec<Dynamic> = args.into_iter().map(|v| self.marshal.to_dynamic(v)).collect();
        let source = handle.source.as_deref();
        self.marshal
            .with_caller(source, || handle.fn_ptr.call::<Dynamic>(&self.engine, &ast, args))
            .map(|value| self.marshal.from_dynamic(value, source))
            .map_err(|err| self.marshal.exception(&err))
    }
}

fn display_name(source_name: &str) -> &str {
    if source_name.is_empty() { "<inline>" } else { source_name }
}

fn is_import_failure(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorInModule(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_import_failure(inner),
        _ => false,
    }
}

// ============================================================================
// 脚本类型
// Script types
// ============================================================================

fn register_promise_type(engine: &mut Engine, marshal: &Marshal) {
    engine.register_type_with_name::<PromiseRef>("Promise");

    let m = marshal.clone();
    engine.register_fn(
        "then",
        move |ctx: NativeCallContext, promise: &mut PromiseRef, on_fulfilled: FnPtr| {
            let source = m.caller_source(ctx.call_source());
            promise.then(Some(script_callable(on_fulfilled, source.as_deref())), None)
        },
    );
    let m = marshal.clone();
    engine.register_fn(
        "then",
        move |ctx: NativeCallContext,
              promise: &mut PromiseRef,
              on_fulfilled: FnPtr,
              on_rejected: FnPtr| {
            let source = m.caller_source(ctx.call_source());
            promise.then(
                Some(script_callable(on_fulfilled, source.as_deref())),
                Some(script_callable(on_rejected, source.as_deref())),
            )
        },
    );
    let m = marshal.clone();
    engine.register_fn(
        "catch_error",
        move |ctx: NativeCallContext, promise: &mut PromiseRef, on_rejected: FnPtr| {
            let source = m.caller_source(ctx.call_source());
            promise.then(None, Some(script_callable(on_rejected, source.as_deref())))
        },
    );

    engine
        .register_get("id", |promise: &mut PromiseRef| promise.id().0 as INT)
        .register_get("state", |promise: &mut PromiseRef| {
            promise.state_name().to_string()
        })
        .register_fn("to_string", |promise: &mut PromiseRef| promise.to_string())
        .register_fn("to_debug", |promise: &mut PromiseRef| promise.to_string());
}

fn register_native_fn_type(engine: &mut Engine, marshal: &Marshal) {
    engine
        .register_type_with_name::<NativeFn>("NativeFunction")
        .register_get("name", |f: &mut NativeFn| f.name().to_string())
        .register_fn("to_string", |f: &mut NativeFn| format!("<native {}>", f.name()));

    let m = marshal.clone();
    engine.register_fn("invoke", move |ctx: NativeCallContext, f: &mut NativeFn| {
        invoke_native(&m, ctx.call_source(), f, Vec::new())
    });
    let m = marshal.clone();
    engine.register_fn(
        "invoke",
        move |ctx: NativeCallContext, f: &mut NativeFn, a: Dynamic| {
            invoke_native(&m, ctx.call_source(), f, vec![a])
        },
    );
    let m = marshal.clone();
    engine.register_fn(
        "invoke",
        move |ctx: NativeCallContext, f: &mut NativeFn, a: Dynamic, b: Dynamic| {
            invoke_native(&m, ctx.call_source(), f, vec![a, b])
        },
    );
    let m = marshal.clone();
    engine.register_fn(
        "invoke",
        move |ctx: NativeCallContext, f: &mut NativeFn, a: Dynamic, b: Dynamic, c: Dynamic| {
            invoke_native(&m, ctx.call_source(), f, vec![a, b, c])
        },
    );
}

fn invoke_native(
    marshal: &Marshal,
    source: Option<&str>,
    function: &NativeFn,
    args: Vec<Dynamic>,
) -> RhaiResult {
    let source = marshal.caller_source(source);
    let args = args
        .into_iter()
        .map(|arg| marshal.from_dynamic(arg, source.as_deref()))
        .collect();
    match function.call(args) {
        Ok(value) => Ok(marshal.to_dynamic(value)),
        Err(err) => Err(marshal.throw(Value::map([
            ("message", Value::from(err.message)),
            ("function", Value::from(function.name())),
        ]))),
    }
}

#[cfg(test)]
mod tests;
