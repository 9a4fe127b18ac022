//! `import` support: resolve, load and cache modules for the engine.

use super::marshal::Marshal;
use crate::builtins::{BuiltinModule, BuiltinRegistry};
use crate::error::HostError;
use crate::resolver::{ModuleKind, ModuleResolver, RemoteFetcher, ResolvedModule};
use gode_kernel::{LoadError, NativeFn, ScriptException, Value};
use gode_plugins::{PluginManager, PluginModule};
use parking_lot::Mutex;
use rhai::{
    AST, Dynamic, Engine, EvalAltResult, FnNamespace, FuncRegistration, Module, NativeCallContext,
    Position, Scope,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Namespace under which in-process plugins are importable (`plugin:<name>`).
pub const PLUGIN_NAMESPACE: &str = "plugin";

/// Everything the host and the engine's module resolver share.
pub struct HostState {
    pub resolver: ModuleResolver,
    pub plugins: PluginManager,
    pub builtins: BuiltinRegistry,
    pub fetcher: Option<Arc<dyn RemoteFetcher>>,
    /// Loaded modules by canonical key
    pub modules: HashMap<String, Arc<Module>>,
    /// Compiled scripts by source name; callbacks are looked up here
    pub asts: HashMap<String, Arc<AST>>,
    /// Modules currently being evaluated, outermost first
    pub loading: Vec<String>,
    /// Innermost typed error behind a failed `import`
    pub import_error: Option<HostError>,
}

impl HostState {
    pub fn new(resolver: ModuleResolver, plugins: PluginManager, builtins: BuiltinRegistry) -> Self {
        Self {
            resolver,
            plugins,
            builtins,
            fetcher: None,
            modules: HashMap::new(),
            asts: HashMap::new(),
            loading: Vec::new(),
            import_error: None,
        }
    }
}

pub type SharedState = Arc<Mutex<HostState>>;

/// `rhai::ModuleResolver` backed by the host's resolver and loaders.
pub struct HostModules {
    state: SharedState,
    marshal: Marshal,
}

impl HostModules {
    pub fn new(state: SharedState, marshal: Marshal) -> Self {
        Self { state, marshal }
    }

    fn load(&self, engine: &Engine, referrer: &str, specifier: &str) -> Result<Arc<Module>, HostError> {
        let resolved = self.state.lock().resolver.resolve(specifier, referrer)?;
        let key = resolved.canonical_key.clone();
        {
            let state = self.state.lock();
            if let Some(module) = state.modules.get(&key) {
                return Ok(module.clone());
            }
            if state.loading.contains(&key) {
                let mut chain = state.loading.clone();
                chain.push(key);
                return Err(HostError::CyclicImport { chain });
            }
        }

        debug!(specifier, key = %key, kind = %resolved.kind, "loading module");
        let module = match resolved.kind {
            ModuleKind::BuiltIn => self.load_builtin(&key)?,
            ModuleKind::NativePlugin => self.load_native(&resolved)?,
            ModuleKind::Script => {
                let path = resolved.path.as_deref().ok_or_else(|| {
                    LoadError::Io(std::io::Error::other(format!("no path for {}", key)))
                })?;
                let source = std::fs::read_to_string(path)?;
                self.load_script(engine, &key, &source)?
            }
            ModuleKind::Remote => {
                let fetcher = self.state.lock().fetcher.clone();
                let (fetcher, handle) = match (fetcher, resolved.remote.as_ref()) {
                    (Some(fetcher), Some(handle)) => (fetcher, handle),
                    _ => return Err(LoadError::RemoteUnavailable(key).into()),
                };
                let source = fetcher.fetch(handle).map_err(|message| HostError::Fetch {
                    url: key.clone(),
                    message,
                })?;
                self.load_script(engine, &key, &source)?
            }
        };

        self.state.lock().modules.insert(key, module.clone());
        Ok(module)
    }

    fn load_builtin(&self, key: &str) -> Result<Arc<Module>, HostError> {
        let state = self.state.lock();
        if let Some(builtin) = state.builtins.get(key) {
            return Ok(Arc::new(builtin_module(builtin, &self.marshal)));
        }
        let plugin = key
            .strip_prefix(PLUGIN_NAMESPACE)
            .and_then(|rest| rest.strip_prefix(':'))
            .and_then(|name| state.plugins.module(name));
        match plugin {
            Some(plugin) => Ok(Arc::new(plugin_module(&plugin, &self.marshal))),
            None => Err(HostError::UnknownBuiltin(key.to_string())),
        }
    }

    fn load_native(&self, resolved: &ResolvedModule) -> Result<Arc<Module>, HostError> {
        let path = resolved.path.as_deref().ok_or_else(|| {
            LoadError::Io(std::io::Error::other(format!(
                "no path for {}",
                resolved.canonical_key
            )))
        })?;
        let plugin = self.state.lock().plugins.activate_path(path)?;
        info!(plugin = %plugin.plugin, exports = plugin.functions.len(), "native module imported");
        Ok(Arc::new(plugin_module(&plugin, &self.marshal)))
    }

    fn load_script(&self, engine: &Engine, key: &str, source: &str) -> Result<Arc<Module>, HostError> {
        let mut ast = engine.compile(source).map_err(|err| HostError::Compile {
            source_name: key.to_string(),
            message: err.to_string(),
        })?;
        ast.set_source(key);
        let ast = Arc::new(ast);
        {
            let mut state = self.state.lock();
            state.asts.insert(key.to_string(), ast.clone());
            state.loading.push(key.to_string());
        }

        // Lock released: evaluation re-enters `resolve` for nested imports.
        let result = Module::eval_ast_as_new(Scope::new(), &ast, engine);
        self.state.lock().loading.retain(|k| k != key);

        let module = result.map_err(|err| HostError::Script(self.marshal.exception(&err)))?;
        Ok(Arc::new(module))
    }
}

impl rhai::ModuleResolver for HostModules {
    fn resolve(
        &self,
        engine: &Engine,
        source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Arc<Module>, Box<EvalAltResult>> {
        self.load(engine, source.unwrap_or(""), path).map_err(|err| {
            let message = err.to_string();
            let mut state = self.state.lock();
            if state.import_error.is_none() {
                state.import_error = Some(err);
            }
            Box::new(EvalAltResult::ErrorInModule(
                path.to_string(),
                Box::new(EvalAltResult::ErrorRuntime(message.into(), pos)),
                pos,
            ))
        })
    }
}

// ============================================================================
// 原生函数模块
// Native function modules
// ============================================================================

/// Highest parameter count a plugin or built-in export can be imported with.
pub const MAX_EXPORT_ARITY: usize = 8;

type ModuleCall = Arc<dyn Fn(Option<&str>, Vec<Dynamic>) -> RhaiResult + Send + Sync>;

type RhaiResult = Result<Dynamic, Box<EvalAltResult>>;

/// Register `call` as `name` taking `arity` arguments.
///
/// Returns `false` when the arity is above [`MAX_EXPORT_ARITY`].
fn set_module_fn(module: &mut Module, name: &str, arity: usize, call: ModuleCall) -> bool {
    let registration = FuncRegistration::new(name).with_namespace(FnNamespace::Internal);
    macro_rules! register {
        ($($arg:ident),*) => {{
            registration.set_into_module(
                module,
                move |ctx: NativeCallContext $(, $arg: Dynamic)*| -> RhaiResult {
                    call(ctx.call_source(), vec![$($arg),*])
                },
            );
        }};
    }
    match arity {
        0 => register!(),
        1 => register!(a),
        2 => register!(a, b),
        3 => register!(a, b, c),
        4 => register!(a, b, c, d),
        5 => register!(a, b, c, d, e),
        6 => register!(a, b, c, d, e, f),
        7 => register!(a, b, c, d, e, f, g),
        8 => register!(a, b, c, d, e, f, g, h),
        _ => return false,
    }
    true
}

/// Rhai module exposing a plugin's exports.
pub fn plugin_module(plugin: &PluginModule, marshal: &Marshal) -> Module {
    let mut module = Module::new();
    module.set_id(format!("{}:{}", PLUGIN_NAMESPACE, plugin.plugin));
    for (name, function) in &plugin.functions {
        let arity = function.script_arity();
        let function = function.clone();
        let marshal = marshal.clone();
        let call: ModuleCall = Arc::new(move |call_source, args| {
            let source = marshal.caller_source(call_source);
            let values = args
                .into_iter()
                .map(|arg| marshal.from_dynamic(arg, source.as_deref()))
                .collect();
            match function.call(values) {
                Ok(value) => Ok(marshal.to_dynamic(value)),
                Err(err) => Err(marshal.throw(ScriptException::from(err).to_value())),
            }
        });
        if !set_module_fn(&mut module, name, arity, call) {
            warn!(plugin = %plugin.plugin, function = %name, arity, "too many parameters, export skipped");
        }
    }
    module
}

/// Rhai module exposing a built-in module.
pub fn builtin_module(builtin: &BuiltinModule, marshal: &Marshal) -> Module {
    let mut module = Module::new();
    for entry in builtin.functions() {
        let function: NativeFn = entry.function.clone();
        let marshal = marshal.clone();
        let call: ModuleCall = Arc::new(move |call_source, args| {
            let source = marshal.caller_source(call_source);
            let values = args
                .into_iter()
                .map(|arg| marshal.from_dynamic(arg, source.as_deref()))
                .collect();
            function.call(values).map(|v| marshal.to_dynamic(v)).map_err(|err| {
                marshal.throw(Value::map([
                    ("message", Value::from(err.message)),
                    ("function", Value::from(function.name())),
                ]))
            })
        });
        if !set_module_fn(&mut module, &entry.name, entry.arity, call) {
            warn!(function = %entry.name, arity = entry.arity, "too many parameters, built-in skipped");
        }
    }
    module
}
