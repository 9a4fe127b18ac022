//! gode runtime
//!
//! 脚本宿主运行时
//! Script host runtime: module resolution, the Rhai engine adapter and the
//! [`ScriptEngineHost`] that drives them.
//!
//! - [`resolver`]: specifier → [`ResolvedModule`], with import map and cache
//! - [`builtins`]: host-provided `gode:*` modules
//! - [`engine`]: value marshalling, `import` loading, script callbacks
//! - [`host`]: drain loop, plugin registration, disposal

pub mod builtins;
pub mod engine;
pub mod error;
pub mod host;
pub mod resolver;

pub use builtins::{BuiltinFunction, BuiltinModule, BuiltinRegistry};
pub use engine::{PLUGIN_NAMESPACE, PromiseRef, RhaiEngine};
pub use error::{HostError, HostResult, IntoHostReport};
pub use host::ScriptEngineHost;
pub use resolver::{
    FileProbe, FsProbe, ImportMap, ModuleKind, ModuleResolver, RemoteFetcher, RemoteHandle,
    ResolvedModule, ResolverStats,
};

// Re-exports embedders need alongside the host.
pub use gode_kernel::{DisposalReport, HostConfig, RunOutcome, Value};
