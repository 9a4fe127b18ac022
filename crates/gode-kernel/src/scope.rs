//! The engine capability handed to queued operations.

use crate::error::ScriptException;
use crate::value::{ScriptFunction, Value};

/// 宿主线程上的引擎访问
/// Engine access available on the host thread
///
/// Queued operations receive a `&mut dyn HostScope` while they run. It is the
/// only path by which deferred work reaches engine state.
pub trait HostScope {
    /// Invoke a script function with the given arguments.
    fn call_function(
        &mut self,
        function: &ScriptFunction,
        args: Vec<Value>,
    ) -> Result<Value, ScriptException>;
}

/// A scope with no engine attached.
///
/// Useful when draining operations that never call back into script, e.g.
/// while loading plugins from the command line.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedScope;

impl HostScope for DetachedScope {
    fn call_function(
        &mut self,
        function: &ScriptFunction,
        _args: Vec<Value>,
    ) -> Result<Value, ScriptException> {
        Err(ScriptException::new(format!(
            "cannot call '{}': no script engine attached",
            function.name()
        )))
    }
}
