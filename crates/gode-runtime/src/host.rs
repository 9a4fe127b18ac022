//! 脚本宿主
//! Script engine host
//!
//! [`ScriptEngineHost`] owns the engine, the operation queue and the plugin
//! manager. Everything that touches the engine runs on the thread that
//! created the host: scripts, queued continuations and module loading.
//!
//! ```rust,ignore
//! let mut host = ScriptEngineHost::new(HostConfig::discover(".")?)?;
//! host.run_file("main.rhai")?;
//! let report = host.dispose();
//! ```

use crate::builtins::BuiltinRegistry;
use crate::engine::{HostState, Marshal, PLUGIN_NAMESPACE, RhaiEngine, SharedState};
use crate::error::{HostError, HostResult, IntoHostReport};
use crate::resolver::{ModuleResolver, RemoteFetcher, ResolvedModule, ResolverStats};
use error_stack::{Report, ResultExt};
use gode_kernel::{
    DisposalReport, HostConfig, NativePlugin, OperationQueue, PromiseId, QueueMetrics, RunOutcome,
    Value,
};
use gode_plugins::{PluginDescriptor, PluginManager, PromiseState, PromiseTable};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 脚本宿主
/// Script engine host
pub struct ScriptEngineHost {
    queue: OperationQueue,
    engine: RhaiEngine,
    state: SharedState,
    promises: PromiseTable,
    config: HostConfig,
    /// Rejections already logged
    reported: BTreeSet<PromiseId>,
    report: Option<DisposalReport>,
}

impl ScriptEngineHost {
    /// 创建宿主
    /// Create a host bound to the calling thread
    ///
    /// Fails only when the worker pool cannot start.
    pub fn new(config: HostConfig) -> HostResult<Self> {
        let queue = OperationQueue::from_config(&config.queue);
        queue.bind_to_current_thread();

        let plugins = PluginManager::from_config(queue.sender(), &config)
            .into_report()
            .attach("starting the plugin worker pool")?;
        let promises = plugins.promises().clone();
        let builtins = BuiltinRegistry::with_defaults(queue.sender(), plugins.workers());

        let mut resolver = ModuleResolver::from_config(&config);
        resolver.add_builtin_namespace(PLUGIN_NAMESPACE);
        info!(base_dir = %resolver.base_dir().display(), "script host ready");

        let state: SharedState = Arc::new(Mutex::new(HostState::new(resolver, plugins, builtins)));
        let engine = RhaiEngine::new(state.clone(), Marshal::new(promises.clone()));

        Ok(Self {
            queue,
            engine,
            state,
            promises,
            config,
            reported: BTreeSet::new(),
            report: None,
        })
    }

    /// Host with default settings rooted at `base_dir`.
    pub fn with_base_dir(base_dir: impl AsRef<Path>) -> HostResult<Self> {
        Self::new(HostConfig {
            base_dir: Some(base_dir.as_ref().to_path_buf()),
            ..HostConfig::default()
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Supply the fetcher used for `http(s)://` imports.
    pub fn set_fetcher(&mut self, fetcher: Arc<dyn RemoteFetcher>) {
        self.state.lock().fetcher = Some(fetcher);
    }

    // ========================================================================
    // 插件
    // Plugins
    // ========================================================================

    /// 注册进程内插件
    /// Activate an in-process plugin; scripts import it as `plugin:<name>`
    ///
    /// Returns the export names.
    pub fn register_plugin(&mut self, plugin: Box<dyn NativePlugin>) -> HostResult<Vec<String>> {
        self.ensure_live()?;
        let name = plugin.name().to_string();
        let module = self
            .state
            .lock()
            .plugins
            .activate_static(plugin)
            .into_report()
            .attach(format!("registering plugin '{}'", name))?;
        Ok(module.names().into_iter().map(String::from).collect())
    }

    /// Activate the plugin library at `path` ahead of any import.
    pub fn load_plugin(&mut self, path: impl AsRef<Path>) -> HostResult<Vec<String>> {
        self.ensure_live()?;
        let path = path.as_ref();
        let module = self
            .state
            .lock()
            .plugins
            .activate_path(path)
            .into_report()
            .attach(format!("loading plugin library {}", path.display()))?;
        Ok(module.names().into_iter().map(String::from).collect())
    }

    /// Active export namespace: plugin name → export names.
    pub fn namespace(&self) -> BTreeMap<String, Vec<String>> {
        self.state.lock().plugins.namespace()
    }

    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.state
            .lock()
            .plugins
            .descriptors()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Call a plugin export directly, bypassing the engine.
    pub fn call(&self, plugin: &str, function: &str, args: Vec<Value>) -> HostResult<Value> {
        self.ensure_live()?;
        self.state
            .lock()
            .plugins
            .call(plugin, function, args)
            .into_report()
    }

    // ========================================================================
    // 解析与执行
    // Resolution and evaluation
    // ========================================================================

    pub fn resolve(&self, specifier: &str, referrer: &str) -> HostResult<ResolvedModule> {
        self.state
            .lock()
            .resolver
            .resolve(specifier, referrer)
            .into_report()
    }

    pub fn resolver_stats(&self) -> ResolverStats {
        self.state.lock().resolver.stats()
    }

    /// Evaluate inline code without draining the queue.
    pub fn eval(&mut self, script: &str) -> HostResult<Value> {
        self.ensure_live()?;
        self.engine.eval("", script).map_err(Report::new)
    }

    /// Evaluate inline code, then drain until idle.
    pub fn run_script(&mut self, script: &str) -> HostResult<Value> {
        let value = self.eval(script)?;
        self.run_until_idle();
        Ok(value)
    }

    /// 运行入口脚本
    /// Evaluate the entry script at `path`, then drain until idle
    pub fn run_file(&mut self, path: impl AsRef<Path>) -> HostResult<Value> {
        let value = self.eval_file(path)?;
        self.run_until_idle();
        Ok(value)
    }

    /// Evaluate the entry script at `path` without draining the queue.
    pub fn eval_file(&mut self, path: impl AsRef<Path>) -> HostResult<Value> {
        self.ensure_live()?;
        let path = path.as_ref();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.base_dir().join(path)
        };
        let canonical = std::fs::canonicalize(&path)
            .into_report()
            .attach(format!("opening entry script {}", path.display()))?;
        let source = std::fs::read_to_string(&canonical).into_report()?;
        let name = canonical.to_string_lossy().into_owned();

        self.engine
            .eval(&name, &source)
            .map_err(Report::new)
            .attach(format!("running {}", name))
    }

    /// 排空队列
    /// Drain until no operation is queued and no async work is outstanding
    ///
    /// Returns the number of operations executed.
    pub fn run_until_idle(&mut self) -> usize {
        let executed = self.queue.run_until_idle(&mut self.engine);
        self.settle_up();
        executed
    }

    /// Drain for at most `timeout`.
    pub fn run_for(&mut self, timeout: Duration) -> RunOutcome {
        let outcome = self.queue.run_for(&mut self.engine, timeout);
        if outcome == RunOutcome::Idle {
            self.settle_up();
        }
        outcome
    }

    /// Run whatever is queued right now.
    pub fn drain(&mut self) -> usize {
        self.queue.drain(&mut self.engine)
    }

    /// Lines printed by scripts.
    pub fn output(&self) -> Vec<String> {
        self.engine.output()
    }

    /// Also hand every printed line to `sink` as it is produced.
    pub fn on_output<F>(&mut self, sink: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.engine.set_output_sink(Box::new(sink));
    }

    pub fn queue_metrics(&self) -> QueueMetrics {
        self.queue.metrics()
    }

    pub fn promise_state(&self, id: PromiseId) -> Option<PromiseState> {
        self.promises.state(id)
    }

    /// Promises the host still tracks: pending, held by a script, or
    /// settled since the last drain.
    pub fn live_promises(&self) -> usize {
        self.promises.len()
    }

    /// Rejected promises no handler has observed.
    pub fn unhandled_rejections(&self) -> Vec<(PromiseId, Value)> {
        self.promises.unhandled_rejections()
    }

    /// Evict settled promises, then log rejections nobody handled.
    fn settle_up(&mut self) {
        self.promises.collect_settled();
        for (id, reason) in self.promises.unhandled_rejections() {
            if self.reported.insert(id) {
                warn!(promise = %id, reason = ?reason, "unhandled promise rejection");
            }
        }
    }

    // ========================================================================
    // 释放
    // Disposal
    // ========================================================================

    pub fn is_disposed(&self) -> bool {
        self.report.is_some()
    }

    /// 释放宿主
    /// Tear the host down
    ///
    /// Closes the queue, disposes plugins in reverse load order and stops the
    /// worker pool. Calling it again returns the first report.
    pub fn dispose(&mut self) -> DisposalReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        let dropped = self.queue.close();
        let report = {
            let mut state = self.state.lock();
            let report = state.plugins.dispose_all();
            state.modules.clear();
            state.asts.clear();
            report
        };
        self.promises.clear();

        if report.is_clean() {
            info!(plugins = report.disposed.len(), dropped, "script host disposed");
        } else {
            warn!(
                plugins = report.disposed.len(),
                failed = ?report.failed_plugins(),
                dropped,
                "script host disposed with failures"
            );
        }
        self.report = Some(report.clone());
        report
    }

    fn ensure_live(&self) -> HostResult<()> {
        if self.is_disposed() {
            return Err(Report::new(HostError::Disposed));
        }
        Ok(())
    }
}

impl Drop for ScriptEngineHost {
    fn drop(&mut self) {
        self.dispose();
    }
}
