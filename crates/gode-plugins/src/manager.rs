//! 插件管理器
//! Plugin manager
//!
//! Drives each plugin through `Discovered → Loaded → Initialized → Active`,
//! owns the active export namespace, and tears everything down in reverse
//! load order. Lives on the host thread.

use crate::bridge::{BridgeContext, ExportGuard, PluginModule, install_exports};
use crate::error::{PluginError, PluginResult};
use crate::loader::{DynamicPlugin, PluginLoader};
use crate::promise::PromiseTable;
use crate::registry::{PluginDescriptor, PluginRegistry};
use crate::workers::{WorkerHandle, WorkerPool};
use gode_kernel::plugin::fault_from_panic;
use gode_kernel::{
    DisposalError, DisposalReport, HostCapability, HostConfig, InitializationError, LoadError,
    NativePlugin, PluginState, QueueSender, Value,
};
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long disposal waits for in-flight worker jobs.
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// 插件管理器
/// Plugin manager
pub struct PluginManager {
    loader: PluginLoader,
    registry: PluginRegistry,
    /// Active export namespace, by plugin name
    modules: BTreeMap<String, Arc<PluginModule>>,
    /// Export guards, by registry index
    guards: HashMap<usize, Arc<ExportGuard>>,
    context: BridgeContext,
    workers: WorkerPool,
    disposed: bool,
}

impl PluginManager {
    /// 创建插件管理器
    /// Create a manager bound to the host's queue
    pub fn new(sender: QueueSender, workers: usize) -> PluginResult<Self> {
        let workers = WorkerPool::new(workers).map_err(|e| PluginError::Workers(e.to_string()))?;
        let context = BridgeContext {
            promises: PromiseTable::new(sender.clone()),
            workers: workers.handle(),
            sender,
        };
        Ok(Self {
            loader: PluginLoader::new(),
            registry: PluginRegistry::new(),
            modules: BTreeMap::new(),
            guards: HashMap::new(),
            context,
            workers,
            disposed: false,
        })
    }

    /// 从配置创建
    /// Create from host configuration (worker count and search paths)
    pub fn from_config(sender: QueueSender, config: &HostConfig) -> PluginResult<Self> {
        let mut manager = Self::new(sender, config.queue.workers)?;
        for path in config.plugin_search_paths() {
            manager.add_search_path(path);
        }
        Ok(manager)
    }

    pub fn add_search_path<P: AsRef<Path>>(&mut self, path: P) {
        self.loader.add_search_path(path);
    }

    /// Locate a library by bare name in the search paths.
    pub fn find_plugin(&self, name: &str) -> Option<PathBuf> {
        self.loader.find_plugin(name)
    }

    pub fn promises(&self) -> &PromiseTable {
        &self.context.promises
    }

    pub fn workers(&self) -> WorkerHandle {
        self.context.workers.clone()
    }

    pub fn sender(&self) -> &QueueSender {
        &self.context.sender
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn descriptors(&self) -> Vec<&PluginDescriptor> {
        self.registry.list()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // ========================================================================
    // Activation
    // ========================================================================

    /// 激活动态库插件
    /// Activate the plugin in the library at `path`
    ///
    /// Activating the same library again returns the installed module. A
    /// plugin whose `initialize` failed earlier is retried.
    pub fn activate_path<P: AsRef<Path>>(&mut self, path: P) -> PluginResult<Arc<PluginModule>> {
        if self.disposed {
            return Err(PluginError::ShutDown);
        }
        let library = self.loader.load_library(path)?;

        if let Some(index) = self.registry.index_by_path(library.path()) {
            return self.resume(index);
        }

        let plugin = DynamicPlugin::new(library.clone());
        let index = self.registry.register(Box::new(plugin), Some(library));
        self.activate(index)
    }

    /// 激活进程内插件
    /// Activate an in-process plugin
    pub fn activate_static(
        &mut self,
        plugin: Box<dyn NativePlugin>,
    ) -> PluginResult<Arc<PluginModule>> {
        if self.disposed {
            return Err(PluginError::ShutDown);
        }
        let index = self.registry.register(plugin, None);
        self.activate(index)
    }

    fn resume(&mut self, index: usize) -> PluginResult<Arc<PluginModule>> {
        let descriptor = self
            .registry
            .entry_mut(index)
            .map(|e| e.descriptor.clone())
            .ok_or_else(|| PluginError::NotFound(format!("#{}", index)))?;

        match descriptor.state {
            PluginState::Active => self
                .modules
                .get(&descriptor.name)
                .cloned()
                .ok_or(PluginError::NotFound(descriptor.name)),
            PluginState::Loaded => self.activate(index),
            actual => Err(PluginError::InvalidState {
                plugin: descriptor.name,
                actual,
                requested: PluginState::Active,
            }),
        }
    }

    fn activate(&mut self, index: usize) -> PluginResult<Arc<PluginModule>> {
        let entry = self
            .registry
            .entry_mut(index)
            .ok_or_else(|| PluginError::NotFound(format!("#{}", index)))?;
        let name = entry.descriptor.name.clone();
        if entry.descriptor.state == PluginState::Discovered {
            entry.descriptor.transition(PluginState::Loaded)?;
        }

        if self.registry.name_taken(&name, index) {
            self.retire(index, false);
            return Err(LoadError::DuplicateName(name).into());
        }

        self.initialize(index, &name)?;

        match self.install(index, &name) {
            Ok(module) => Ok(module),
            Err(err) => {
                warn!(plugin = %name, error = %err, "export installation failed");
                self.retire(index, true);
                Err(err)
            }
        }
    }

    fn initialize(&mut self, index: usize, name: &str) -> PluginResult<()> {
        let capability = HostCapability::new(self.context.sender.clone(), format!("plugin:{}", name));
        let entry = self
            .registry
            .entry_mut(index)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let plugin = entry
            .plugin
            .as_mut()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        let result = panic::catch_unwind(AssertUnwindSafe(|| plugin.initialize(capability)))
            .unwrap_or_else(|payload| Err(fault_from_panic(payload.as_ref())));
        if let Err(source) = result {
            // Stays Loaded; a later activation retries.
            warn!(plugin = %name, error = %source, "plugin initialization failed");
            return Err(InitializationError {
                plugin: name.to_string(),
                source,
            }
            .into());
        }

        entry.descriptor.transition(PluginState::Initialized)
    }

    fn install(&mut self, index: usize, name: &str) -> PluginResult<Arc<PluginModule>> {
        let entry = self
            .registry
            .entry_mut(index)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let plugin = entry
            .plugin
            .as_ref()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        let exports = panic::catch_unwind(AssertUnwindSafe(|| plugin.exports())).map_err(|payload| {
            LoadError::InvalidExport {
                plugin: name.to_string(),
                export: "*".to_string(),
                reason: fault_from_panic(payload.as_ref()).message,
            }
        })?;

        let guard = ExportGuard::new(name);
        let module = install_exports(name, exports, &guard, &self.context, entry.library.as_ref())?;

        entry.descriptor.exports = module.names().into_iter().map(String::from).collect();
        entry.descriptor.transition(PluginState::Active)?;
        info!(
            plugin = %name,
            version = %entry.descriptor.version,
            exports = module.functions.len(),
            "plugin activated"
        );

        let module = Arc::new(module);
        self.guards.insert(index, guard);
        self.modules.insert(name.to_string(), module.clone());
        Ok(module)
    }

    /// Take a plugin out of service without reporting, optionally calling
    /// `dispose` first.
    fn retire(&mut self, index: usize, dispose: bool) {
        let Some(entry) = self.registry.entry_mut(index) else {
            return;
        };
        if dispose && entry.descriptor.state.needs_dispose() {
            if let Some(plugin) = entry.plugin.as_mut() {
                let result = panic::catch_unwind(AssertUnwindSafe(|| plugin.dispose()))
                    .unwrap_or_else(|payload| Err(fault_from_panic(payload.as_ref())));
                if let Err(err) = result {
                    warn!(plugin = %entry.descriptor.name, error = %err, "dispose failed");
                }
            }
        }
        if let Err(err) = entry.descriptor.transition(PluginState::Disposed) {
            debug!(error = %err, "plugin already retired");
        }
        entry.plugin = None;
        if let Some(library) = entry.library.take() {
            self.loader.release(library.path());
        }
    }

    // ========================================================================
    // Namespace
    // ========================================================================

    /// 活跃导出命名空间
    /// Active export namespace: plugin name → export names
    pub fn namespace(&self) -> BTreeMap<String, Vec<String>> {
        self.modules
            .iter()
            .map(|(plugin, module)| {
                (
                    plugin.clone(),
                    module.names().into_iter().map(String::from).collect(),
                )
            })
            .collect()
    }

    pub fn module(&self, plugin: &str) -> Option<Arc<PluginModule>> {
        self.modules.get(plugin).cloned()
    }

    /// Call an export directly, outside the script engine.
    pub fn call(&self, plugin: &str, function: &str, args: Vec<Value>) -> PluginResult<Value> {
        let module = self
            .modules
            .get(plugin)
            .ok_or_else(|| PluginError::NotFound(plugin.to_string()))?;
        let export = module
            .get(function)
            .ok_or_else(|| PluginError::NotFound(format!("{}.{}", plugin, function)))?;
        Ok(export.call(args)?)
    }

    // ========================================================================
    // Disposal
    // ========================================================================

    /// 释放所有插件
    /// Dispose every plugin in reverse load order
    ///
    /// Failures are collected, never raised; every plugin is visited. Exports
    /// still held by scripts fail with a "plugin disposed" error afterwards.
    /// Idempotent: later calls return an empty report.
    pub fn dispose_all(&mut self) -> DisposalReport {
        let mut report = DisposalReport::default();
        if self.disposed {
            return report;
        }
        self.disposed = true;

        for index in (0..self.registry.len()).rev() {
            if let Some(guard) = self.guards.remove(&index) {
                guard.mark_disposed();
            }
            let Some(entry) = self.registry.entry_mut(index) else {
                continue;
            };
            if entry.descriptor.state.is_terminal() {
                continue;
            }
            let name = entry.descriptor.name.clone();

            if entry.descriptor.state.needs_dispose() {
                if let Some(plugin) = entry.plugin.as_mut() {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| plugin.dispose()))
                        .unwrap_or_else(|payload| Err(fault_from_panic(payload.as_ref())));
                    report.disposed.push(name.clone());
                    match result {
                        Ok(()) => info!(plugin = %name, "plugin disposed"),
                        Err(err) => {
                            warn!(plugin = %name, error = %err, "plugin dispose failed");
                            report.failures.push(DisposalError {
                                plugin: name.clone(),
                                message: err.message,
                            });
                        }
                    }
                }
            }

            if let Err(err) = entry.descriptor.transition(PluginState::Disposed) {
                debug!(plugin = %name, error = %err, "unexpected state at disposal");
            }
            entry.plugin = None;
            if let Some(library) = entry.library.take() {
                self.loader.release(library.path());
            }
        }

        self.modules.clear();
        self.workers.shutdown(WORKER_SHUTDOWN_TIMEOUT);
        info!(%report, "plugin manager disposed");
        report
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        if !self.disposed {
            let report = self.dispose_all();
            if !report.is_clean() {
                warn!(%report, "plugins disposed on drop with failures");
            }
        }
    }
}
