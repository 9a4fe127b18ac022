//! gode kernel
//!
//! 脚本宿主与原生插件共享的核心类型
//! Core types shared by the script host and native plugins: the tagged value
//! model, the operation queue, the host capability and the plugin contract.

// value module
pub mod value;
pub use value::{Callable, NativeFn, ParamKind, PromiseId, ScriptFunction, Value, ValueMap};

// error module
pub mod error;
pub use error::{
    DisposalError, DisposalReport, InitializationError, LoadError, NativeError, OperationError,
    ResolutionError, ResolutionFailure, RuntimeBridgeError, ScriptException,
};

// engine scope
pub mod scope;
pub use scope::{DetachedScope, HostScope};

// operation queue
pub mod queue;
pub use queue::{
    OperationQueue, Origin, QueueMetrics, QueueSender, QueuedOperation, RunOutcome, WorkTicket,
};

// capability module
pub mod capability;
pub use capability::HostCapability;

// plugin contract
pub mod plugin;
pub use plugin::{
    Completion, Deferred, Export, ExportKind, ExportTable, ExportedFunction, NativePlugin,
    PluginState,
};

// config module
pub mod config;
pub use config::HostConfig;

// logging module
pub mod logging;
