//! 模块解析器
//! Module resolver
//!
//! Turns a specifier written by a script into a [`ResolvedModule`]. Strategies
//! are tried in order and the first match wins:
//!
//! 1. built-in namespace (`"<namespace>:<name>"`)
//! 2. import-map alias (longest prefix, bounded and cycle-checked)
//! 3. relative or absolute path
//! 4. URL (`http://`, `https://`), deferred to a [`RemoteFetcher`]
//! 5. dependency manifest entry
//! 6. kind detection by suffix
//!
//! Successful resolutions are cached by canonical key for the life of the
//! resolver. Resolution never touches the engine and never performs network
//! I/O.

mod import_map;
mod probe;

pub use import_map::ImportMap;
pub use probe::{FileProbe, FsProbe};

use gode_kernel::{HostConfig, ResolutionError, ResolutionFailure};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Suffixes of dynamically loadable native libraries.
pub const NATIVE_SUFFIXES: [&str; 3] = ["so", "dylib", "dll"];

// ============================================================================
// 解析结果
// Resolution results
// ============================================================================

/// 模块种类
/// Module kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModuleKind {
    BuiltIn,
    Script,
    NativePlugin,
    Remote,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleKind::BuiltIn => "builtin",
            ModuleKind::Script => "script",
            ModuleKind::NativePlugin => "native",
            ModuleKind::Remote => "remote",
        };
        f.write_str(name)
    }
}

/// Deferred reference to a remote module. Fetching happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RemoteHandle {
    url: String,
}

impl RemoteHandle {
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Fetches remote module source on behalf of the host.
pub trait RemoteFetcher: Send + Sync {
    fn fetch(&self, handle: &RemoteHandle) -> Result<String, String>;
}

/// 解析后的模块
/// A resolved module; immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedModule {
    /// Fully resolved path, URL or built-in name
    pub canonical_key: String,
    pub kind: ModuleKind,
    /// File to load, for scripts and native plugins
    pub path: Option<PathBuf>,
    pub remote: Option<RemoteHandle>,
}

impl ResolvedModule {
    fn builtin(name: &str) -> Self {
        Self {
            canonical_key: name.to_string(),
            kind: ModuleKind::BuiltIn,
            path: None,
            remote: None,
        }
    }

    fn file(kind: ModuleKind, path: PathBuf) -> Self {
        Self {
            canonical_key: path.to_string_lossy().into_owned(),
            kind,
            path: Some(path),
            remote: None,
        }
    }

    fn remote(url: &str) -> Self {
        Self {
            canonical_key: url.to_string(),
            kind: ModuleKind::Remote,
            path: None,
            remote: Some(RemoteHandle {
                url: url.to_string(),
            }),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    pub hits: u64,
    pub misses: u64,
    /// File system probes performed
    pub probes: u64,
}

// ============================================================================
// 解析器
// Resolver
// ============================================================================

/// 模块解析器
/// Module resolver
pub struct ModuleResolver {
    namespaces: Vec<String>,
    script_extensions: Vec<String>,
    max_alias_depth: usize,
    import_map: ImportMap,
    dependencies: BTreeMap<String, String>,
    search_paths: Vec<PathBuf>,
    base_dir: PathBuf,
    probe: Box<dyn FileProbe>,
    /// canonical key → module
    cache: HashMap<String, ResolvedModule>,
    /// (specifier, referrer directory) → canonical key
    lookups: HashMap<(String, PathBuf), String>,
    stats: ResolverStats,
}

impl ModuleResolver {
    /// Resolver with default settings rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::from_config(&HostConfig {
            base_dir: Some(base_dir.into()),
            ..HostConfig::default()
        })
    }

    pub fn from_config(config: &HostConfig) -> Self {
        let base_dir = absolute(&config.base_dir());
        Self {
            namespaces: config.resolver.builtin_namespaces.clone(),
            script_extensions: config.resolver.script_extensions.clone(),
            max_alias_depth: config.resolver.max_alias_depth,
            import_map: ImportMap::new(&config.imports, &base_dir),
            dependencies: config.dependencies.clone(),
            search_paths: config.plugin_search_paths(),
            base_dir,
            probe: Box::new(FsProbe),
            cache: HashMap::new(),
            lookups: HashMap::new(),
            stats: ResolverStats::default(),
        }
    }

    pub fn with_probe(mut self, probe: impl FileProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Reserve another built-in namespace.
    pub fn add_builtin_namespace(&mut self, namespace: &str) {
        if !self.namespaces.iter().any(|ns| ns == namespace) {
            self.namespaces.push(namespace.to_string());
        }
    }

    pub fn import_map(&self) -> &ImportMap {
        &self.import_map
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Forget one canonical key. Returns whether it was cached.
    pub fn invalidate(&mut self, canonical_key: &str) -> bool {
        self.lookups.retain(|_, key| key != canonical_key);
        self.cache.remove(canonical_key).is_some()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.lookups.clear();
    }

    /// Whether `specifier` is a well-formed `"<namespace>:<name>"` built-in.
    pub fn is_builtin(&self, specifier: &str) -> bool {
        let Some((namespace, name)) = specifier.split_once(':') else {
            return false;
        };
        self.namespaces.iter().any(|ns| ns == namespace)
            && !name.is_empty()
            && !name.starts_with('/')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
    }

    /// 解析说明符
    /// Resolve `specifier` as imported from `referrer`
    ///
    /// `referrer` is the importing file; empty means the base directory.
    pub fn resolve(
        &mut self,
        specifier: &str,
        referrer: &str,
    ) -> Result<ResolvedModule, ResolutionError> {
        let specifier = specifier.trim();
        if specifier.is_empty() {
            return Err(ResolutionError::new(
                specifier,
                referrer,
                ResolutionFailure::EmptySpecifier,
            ));
        }
        if self.is_builtin(specifier) {
            return Ok(ResolvedModule::builtin(specifier));
        }

        if let Some(hit) = self.cache.get(specifier) {
            self.stats.hits += 1;
            debug!(specifier, "resolver cache hit");
            return Ok(hit.clone());
        }
        let base = self.referrer_dir(referrer);
        let lookup = (specifier.to_string(), base.clone());
        if let Some(hit) = self.lookups.get(&lookup).and_then(|key| self.cache.get(key)) {
            self.stats.hits += 1;
            debug!(specifier, key = %hit.canonical_key, "resolver cache hit");
            return Ok(hit.clone());
        }
        self.stats.misses += 1;

        let mut chain = Vec::new();
        let resolved = self
            .resolve_step(specifier, &base, &mut chain)
            .map_err(|reason| ResolutionError::new(specifier, referrer, reason))?;
        debug!(specifier, referrer, key = %resolved.canonical_key, kind = %resolved.kind, "resolved");

        if resolved.kind != ModuleKind::BuiltIn {
            let key = resolved.canonical_key.clone();
            let cached = self.cache.entry(key.clone()).or_insert(resolved).clone();
            self.lookups.insert(lookup, key);
            return Ok(cached);
        }
        Ok(resolved)
    }

    fn resolve_step(
        &mut self,
        specifier: &str,
        base: &Path,
        chain: &mut Vec<String>,
    ) -> Result<ResolvedModule, ResolutionFailure> {
        if self.is_builtin(specifier) {
            return Ok(ResolvedModule::builtin(specifier));
        }

        if let Some((alias, target)) = self.import_map.substitute(specifier) {
            self.enter(alias, chain)?;
            return self.resolve_step(&target, base, chain);
        }

        if is_path_like(specifier) {
            return self.resolve_path(normalize(&base.join(specifier)));
        }

        if is_url(specifier) {
            return Ok(ResolvedModule::remote(specifier));
        }

        if let Some(source) = self.dependencies.get(specifier).cloned() {
            self.enter(format!("dependency:{}", specifier), chain)?;
            // Declared sources are relative to the manifest, not the importer.
            let manifest_dir = self.base_dir.clone();
            return self.resolve_step(&source, &manifest_dir, chain);
        }

        self.resolve_bare(specifier, base)
    }

    /// Record one substitution; fails on a revisit or when too deep.
    fn enter(&self, link: String, chain: &mut Vec<String>) -> Result<(), ResolutionFailure> {
        if chain.contains(&link) {
            chain.push(link);
            return Err(ResolutionFailure::AliasCycle {
                chain: chain.clone(),
            });
        }
        if chain.len() >= self.max_alias_depth {
            return Err(ResolutionFailure::DepthExceeded {
                limit: self.max_alias_depth,
            });
        }
        chain.push(link);
        Ok(())
    }

    fn resolve_path(&mut self, path: PathBuf) -> Result<ResolvedModule, ResolutionFailure> {
        if let Some(kind) = self.kind_by_suffix(&path) {
            return Ok(ResolvedModule::file(kind, path));
        }

        // No recognised suffix: try each script extension in order.
        for extension in self.script_extensions.clone() {
            let mut candidate = path.clone().into_os_string();
            candidate.push(".");
            candidate.push(&extension);
            let candidate = PathBuf::from(candidate);
            if self.probe(&candidate) {
                return Ok(ResolvedModule::file(ModuleKind::Script, candidate));
            }
        }
        Err(ResolutionFailure::Unresolvable)
    }

    fn resolve_bare(&mut self, specifier: &str, base: &Path) -> Result<ResolvedModule, ResolutionFailure> {
        match self.kind_by_suffix(Path::new(specifier)) {
            Some(ModuleKind::NativePlugin) => {
                for dir in self.search_paths.clone() {
                    let candidate = normalize(&dir.join(specifier));
                    if self.probe(&candidate) {
                        return Ok(ResolvedModule::file(ModuleKind::NativePlugin, candidate));
                    }
                }
                Ok(ResolvedModule::file(
                    ModuleKind::NativePlugin,
                    normalize(&base.join(specifier)),
                ))
            }
            Some(kind) => Ok(ResolvedModule::file(kind, normalize(&base.join(specifier)))),
            None => Err(ResolutionFailure::Unresolvable),
        }
    }

    fn kind_by_suffix(&self, path: &Path) -> Option<ModuleKind> {
        let extension = path.extension()?.to_str()?;
        if NATIVE_SUFFIXES.contains(&extension) {
            Some(ModuleKind::NativePlugin)
        } else if self.script_extensions.iter().any(|e| e == extension) {
            Some(ModuleKind::Script)
        } else {
            None
        }
    }

    fn probe(&mut self, path: &Path) -> bool {
        self.stats.probes += 1;
        self.probe.is_file(path)
    }

    fn referrer_dir(&self, referrer: &str) -> PathBuf {
        if referrer.is_empty() || is_url(referrer) {
            return self.base_dir.clone();
        }
        let referrer = self.base_dir.join(referrer);
        if referrer.to_string_lossy().ends_with('/') {
            return normalize(&referrer);
        }
        referrer
            .parent()
            .map(normalize)
            .unwrap_or_else(|| self.base_dir.clone())
    }
}

impl fmt::Debug for ModuleResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleResolver")
            .field("namespaces", &self.namespaces)
            .field("base_dir", &self.base_dir)
            .field("aliases", &self.import_map.len())
            .field("cached", &self.cache.len())
            .field("stats", &self.stats)
            .finish()
    }
}

fn is_path_like(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
        || Path::new(specifier).is_absolute()
}

fn is_url(specifier: &str) -> bool {
    specifier.starts_with("http://") || specifier.starts_with("https://")
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return normalize(path);
    }
    match std::env::current_dir() {
        Ok(cwd) => normalize(&cwd.join(path)),
        Err(_) => normalize(path),
    }
}

/// Lexical normalization: drops `.` and folds `..` without touching the disk.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}
