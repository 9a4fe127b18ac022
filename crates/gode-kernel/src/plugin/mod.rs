//! 原生插件契约
//! Native plugin contract
//!
//! A plugin is a dynamic library exporting the entry points named in
//! [`symbols`], or an in-process type implementing [`NativePlugin`]. The
//! [`declare_plugin!`](crate::declare_plugin) macro generates the entry points
//! from a `NativePlugin` implementation.

mod state;

pub use state::PluginState;

use crate::capability::HostCapability;
use crate::error::NativeError;
use crate::value::{ParamKind, Value};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// 插件 API 版本
/// Plugin API version
pub const API_VERSION: u32 = 1;

/// 动态库入口点符号名
/// Entry-point symbol names
pub mod symbols {
    pub const API_VERSION: &str = "gode_plugin_api_version";
    pub const NAME: &str = "gode_plugin_name";
    pub const VERSION: &str = "gode_plugin_version";
    pub const DESCRIPTION: &str = "gode_plugin_description";
    pub const INITIALIZE: &str = "gode_plugin_initialize";
    pub const EXPORTS: &str = "gode_plugin_exports";
    pub const DISPOSE: &str = "gode_plugin_dispose";

    /// Every symbol a library must export. `API_VERSION` is optional.
    pub const REQUIRED: [&str; 6] = [NAME, VERSION, DESCRIPTION, INITIALIZE, EXPORTS, DISPOSE];
}

/// Entry-point signatures.
pub type ApiVersionFn = unsafe extern "C" fn() -> u32;
pub type MetadataFn = unsafe extern "C" fn() -> String;
pub type InitializeFn = unsafe extern "C" fn(HostCapability) -> Result<(), NativeError>;
pub type ExportsFn = unsafe extern "C" fn() -> ExportTable;
pub type DisposeFn = unsafe extern "C" fn() -> Result<(), NativeError>;

// ============================================================================
// 插件 trait
// Plugin trait
// ============================================================================

/// 原生插件
/// Native plugin
pub trait NativePlugin: Send {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// 激活插件。能力句柄是插件唯一可以保留的宿主引用。
    /// Activate the plugin. The capability is the only host reference it may keep.
    fn initialize(&mut self, capability: HostCapability) -> Result<(), NativeError>;

    /// The functions this plugin contributes to the script namespace.
    fn exports(&self) -> ExportTable;

    /// Release resources. Called at most once, in reverse load order.
    fn dispose(&mut self) -> Result<(), NativeError> {
        Ok(())
    }
}

// ============================================================================
// 导出函数
// Exported functions
// ============================================================================

pub type SyncFn = Arc<dyn Fn(Vec<Value>) -> Result<Value, NativeError> + Send + Sync>;
pub type CallbackFn = Arc<dyn Fn(Vec<Value>, Completion) -> Result<(), NativeError> + Send + Sync>;
pub type PromiseFn = Arc<dyn Fn(Vec<Value>) -> Result<Deferred, NativeError> + Send + Sync>;

/// 导出函数的调用形态
/// Call shape of an exported function
#[derive(Clone)]
pub enum ExportedFunction {
    /// Runs on the host thread and returns its value directly.
    Sync(SyncFn),
    /// Returns immediately; reports through the supplied [`Completion`].
    CallbackAsync(CallbackFn),
    /// Returns a [`Deferred`] job whose outcome settles a promise.
    PromiseReturning(PromiseFn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportKind {
    Sync,
    CallbackAsync,
    PromiseReturning,
}

impl ExportedFunction {
    pub fn kind(&self) -> ExportKind {
        match self {
            ExportedFunction::Sync(_) => ExportKind::Sync,
            ExportedFunction::CallbackAsync(_) => ExportKind::CallbackAsync,
            ExportedFunction::PromiseReturning(_) => ExportKind::PromiseReturning,
        }
    }
}

impl fmt::Display for ExportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportKind::Sync => write!(f, "sync"),
            ExportKind::CallbackAsync => write!(f, "callback"),
            ExportKind::PromiseReturning => write!(f, "promise"),
        }
    }
}

/// 单个导出项
/// A single export
#[derive(Clone)]
pub struct Export {
    pub name: String,
    /// Parameters the script passes. A callback export's trailing callback is
    /// not listed.
    pub signature: Vec<ParamKind>,
    pub function: ExportedFunction,
}

impl Export {
    pub fn kind(&self) -> ExportKind {
        self.function.kind()
    }

    pub fn arity(&self) -> usize {
        self.signature.len()
    }
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Export")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("kind", &self.kind())
            .finish()
    }
}

/// 导出表
/// Export table
///
/// The export's shape is fixed by which builder method registered it.
#[derive(Clone, Default, Debug)]
pub struct ExportTable {
    exports: Vec<Export>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, export: Export) -> Self {
        self.exports.push(export);
        self
    }

    pub fn sync<F>(self, name: &str, signature: impl Into<Vec<ParamKind>>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, NativeError> + Send + Sync + 'static,
    {
        self.push(Export {
            name: name.to_string(),
            signature: signature.into(),
            function: ExportedFunction::Sync(Arc::new(f)),
        })
    }

    pub fn callback<F>(self, name: &str, signature: impl Into<Vec<ParamKind>>, f: F) -> Self
    where
        F: Fn(Vec<Value>, Completion) -> Result<(), NativeError> + Send + Sync + 'static,
    {
        self.push(Export {
            name: name.to_string(),
            signature: signature.into(),
            function: ExportedFunction::CallbackAsync(Arc::new(f)),
        })
    }

    pub fn promise<F>(self, name: &str, signature: impl Into<Vec<ParamKind>>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Deferred, NativeError> + Send + Sync + 'static,
    {
        self.push(Export {
            name: name.to_string(),
            signature: signature.into(),
            function: ExportedFunction::PromiseReturning(Arc::new(f)),
        })
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Export> {
        self.exports.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.exports.iter().map(|e| e.name.as_str()).collect()
    }
}

impl IntoIterator for ExportTable {
    type Item = Export;
    type IntoIter = std::vec::IntoIter<Export>;

    fn into_iter(self) -> Self::IntoIter {
        self.exports.into_iter()
    }
}

// ============================================================================
// 完成回调
// Completion continuation
// ============================================================================

type CompletionFn = Box<dyn FnOnce(Result<Value, NativeError>) + Send>;

struct CompletionInner {
    label: String,
    deliver: Mutex<Option<CompletionFn>>,
    duplicates: AtomicUsize,
}

impl Drop for CompletionInner {
    fn drop(&mut self) {
        // Work abandoned without reporting still reaches the script.
        if let Some(deliver) = self.deliver.get_mut().take() {
            warn!(completion = %self.label, "completion dropped without a result");
            deliver(Err(NativeError::new("operation finished without reporting a result")));
        }
    }
}

/// 幂等完成回调
/// Idempotent completion continuation
///
/// Clone it freely and call it from any thread. Only the first call is
/// delivered; later calls return `false` and are logged.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Completion {
    pub fn new<F>(label: impl Into<String>, deliver: F) -> Self
    where
        F: FnOnce(Result<Value, NativeError>) + Send + 'static,
    {
        Self {
            inner: Arc::new(CompletionInner {
                label: label.into(),
                deliver: Mutex::new(Some(Box::new(deliver))),
                duplicates: AtomicUsize::new(0),
            }),
        }
    }

    /// Deliver the outcome. Returns `true` only for the first call.
    pub fn complete(&self, result: Result<Value, NativeError>) -> bool {
        let deliver = self.inner.deliver.lock().take();
        match deliver {
            Some(deliver) => {
                deliver(result);
                true
            }
            None => {
                let n = self.inner.duplicates.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    completion = %self.inner.label,
                    duplicates = n,
                    "completion invoked more than once, ignoring"
                );
                false
            }
        }
    }

    pub fn succeed(&self, value: impl Into<Value>) -> bool {
        self.complete(Ok(value.into()))
    }

    pub fn fail(&self, error: impl Into<NativeError>) -> bool {
        self.complete(Err(error.into()))
    }

    pub fn is_completed(&self) -> bool {
        self.inner.deliver.lock().is_none()
    }

    /// Calls ignored after the first.
    pub fn duplicate_calls(&self) -> usize {
        self.inner.duplicates.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("label", &self.inner.label)
            .field("completed", &self.is_completed())
            .finish()
    }
}

// ============================================================================
// 延迟任务
// Deferred job
// ============================================================================

/// A blocking job the bridge runs on a worker; its outcome settles a promise.
pub struct Deferred {
    job: Box<dyn FnOnce() -> Result<Value, NativeError> + Send>,
}

impl Deferred {
    pub fn new<F>(job: F) -> Self
    where
        F: FnOnce() -> Result<Value, NativeError> + Send + 'static,
    {
        Self { job: Box::new(job) }
    }

    pub fn resolved(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self::new(move || Ok(value))
    }

    pub fn rejected(error: impl Into<NativeError>) -> Self {
        let error = error.into();
        Self::new(move || Err(error))
    }

    pub fn run(self) -> Result<Value, NativeError> {
        (self.job)()
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Deferred")
    }
}

/// Turn a caught panic payload into a plugin error.
pub fn fault_from_panic(payload: &(dyn std::any::Any + Send)) -> NativeError {
    NativeError::new(crate::queue::panic_message(payload))
}

// ============================================================================
// 导出宏
// Export macro
// ============================================================================

/// 生成动态库入口点
/// Generate the dynamic-library entry points for a [`NativePlugin`] type
///
/// ```rust,ignore
/// gode_kernel::declare_plugin!(MathPlugin, MathPlugin::default());
/// ```
///
/// The instance is created on first use and dropped after `dispose`. Panics
/// in `initialize` and `dispose` are caught and reported as errors.
#[macro_export]
macro_rules! declare_plugin {
    ($plugin_type:ty, $constructor:expr) => {
        static __GODE_PLUGIN: ::std::sync::Mutex<::std::option::Option<$plugin_type>> =
            ::std::sync::Mutex::new(::std::option::Option::None);

        fn __gode_with_plugin<R>(f: impl FnOnce(&mut $plugin_type) -> R) -> R {
            let mut slot = __GODE_PLUGIN
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let plugin = slot.get_or_insert_with(|| $constructor);
            f(plugin)
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn gode_plugin_api_version() -> u32 {
            $crate::plugin::API_VERSION
        }

        #[allow(improper_ctypes_definitions)]
        #[unsafe(no_mangle)]
        pub extern "C" fn gode_plugin_name() -> ::std::string::String {
            __gode_with_plugin(|p| $crate::plugin::NativePlugin::name(p).to_string())
        }

        #[allow(improper_ctypes_definitions)]
        #[unsafe(no_mangle)]
        pub extern "C" fn gode_plugin_version() -> ::std::string::String {
            __gode_with_plugin(|p| $crate::plugin::NativePlugin::version(p).to_string())
        }

        #[allow(improper_ctypes_definitions)]
        #[unsafe(no_mangle)]
        pub extern "C" fn gode_plugin_description() -> ::std::string::String {
            __gode_with_plugin(|p| $crate::plugin::NativePlugin::description(p).to_string())
        }

        #[allow(improper_ctypes_definitions)]
        #[unsafe(no_mangle)]
        pub extern "C" fn gode_plugin_initialize(
            capability: $crate::HostCapability,
        ) -> ::std::result::Result<(), $crate::NativeError> {
            ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                __gode_with_plugin(|p| $crate::plugin::NativePlugin::initialize(p, capability))
            }))
            .unwrap_or_else(|payload| Err($crate::plugin::fault_from_panic(payload.as_ref())))
        }

        #[allow(improper_ctypes_definitions)]
        #[unsafe(no_mangle)]
        pub extern "C" fn gode_plugin_exports() -> $crate::plugin::ExportTable {
            __gode_with_plugin(|p| $crate::plugin::NativePlugin::exports(p))
        }

        #[allow(improper_ctypes_definitions)]
        #[unsafe(no_mangle)]
        pub extern "C" fn gode_plugin_dispose() -> ::std::result::Result<(), $crate::NativeError> {
            let taken = __GODE_PLUGIN
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            match taken {
                ::std::option::Option::Some(mut plugin) => {
                    ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(move || {
                        $crate::plugin::NativePlugin::dispose(&mut plugin)
                    }))
                    .unwrap_or_else(|payload| {
                        Err($crate::plugin::fault_from_panic(payload.as_ref()))
                    })
                }
                ::std::option::Option::None => ::std::result::Result::Ok(()),
            }
        }
    };
}

#[cfg(test)]
mod tests;
