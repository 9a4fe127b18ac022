//! gode plugins
//!
//! 原生插件子系统
//! Native plugin sub-system: loads plugin libraries, tracks their lifecycle,
//! and bridges their exports into the script value space.
//!
//! - [`loader`]: opens and validates dynamic libraries
//! - [`registry`]: descriptors and lifecycle state, in load order
//! - [`bridge`]: wraps exports as script-callable functions
//! - [`promise`]: promise handles for promise-returning exports
//! - [`workers`]: background runtime for blocking jobs and timers
//! - [`manager`]: activation and disposal

pub mod bridge;
pub mod error;
pub mod loader;
pub mod manager;
pub mod promise;
pub mod registry;
pub mod workers;

pub use bridge::{BridgeContext, BridgedFunction, ExportGuard, PluginModule, install_exports};
pub use error::{PluginError, PluginResult};
pub use loader::{DynamicPlugin, PluginLibrary, PluginLoader};
pub use manager::PluginManager;
pub use promise::{PromiseState, PromiseTable, SWEEP_INTERVAL, invoke_callable};
pub use registry::{PluginDescriptor, PluginRegistry, PluginVersion};
pub use workers::{WorkerHandle, WorkerPool};
