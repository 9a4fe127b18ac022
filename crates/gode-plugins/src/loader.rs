//! Dynamic plugin loader
//!
//! Opens native plugin libraries, validates the entry-point contract and wraps
//! a library as a [`NativePlugin`].

use gode_kernel::plugin::{
    API_VERSION, ApiVersionFn, DisposeFn, ExportsFn, InitializeFn, MetadataFn, symbols,
};
use gode_kernel::{ExportTable, HostCapability, LoadError, NativeError, NativePlugin};
use libloading::Library;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Check that every required entry point is present.
///
/// `has_symbol` reports whether the library exports a symbol. The first
/// missing one is reported.
pub fn validate_entry_points(
    path: &Path,
    has_symbol: impl Fn(&str) -> bool,
) -> Result<(), LoadError> {
    match symbols::REQUIRED.iter().find(|s| !has_symbol(s)) {
        Some(missing) => Err(LoadError::MissingEntryPoint {
            path: path.to_path_buf(),
            symbol: (*missing).to_string(),
        }),
        None => Ok(()),
    }
}

/// Platform file name for a plugin called `name`.
pub fn library_file_name(name: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.dll", name)
    } else if cfg!(target_os = "macos") {
        format!("lib{}.dylib", name)
    } else {
        format!("lib{}.so", name)
    }
}

/// Resolved entry points of an opened library.
#[derive(Clone, Copy)]
struct EntryPoints {
    name: MetadataFn,
    version: MetadataFn,
    description: MetadataFn,
    initialize: InitializeFn,
    exports: ExportsFn,
    dispose: DisposeFn,
}

/// Represents a loaded plugin library
pub struct PluginLibrary {
    /// Path to the library file
    path: PathBuf,
    /// File hash for change detection
    hash: String,
    /// Load timestamp
    loaded_at: Instant,
    /// API version
    api_version: u32,
    entry_points: EntryPoints,
    /// The loaded library; entry points are only valid while it is mapped
    library: Library,
}

impl PluginLibrary {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    /// Whether the library exports `symbol`.
    pub fn has_symbol(&self, symbol: &str) -> bool {
        // SAFETY: the symbol is only looked up, never called.
        unsafe { self.library.get::<*const ()>(symbol.as_bytes()).is_ok() }
    }
}

impl Drop for PluginLibrary {
    fn drop(&mut self) {
        debug!("Unloading plugin library: {:?}", self.path);
    }
}

impl std::fmt::Debug for PluginLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLibrary")
            .field("path", &self.path)
            .field("hash", &self.hash)
            .field("api_version", &self.api_version)
            .finish()
    }
}

/// A [`NativePlugin`] backed by a dynamic library.
pub struct DynamicPlugin {
    name: String,
    version: String,
    description: String,
    library: Arc<PluginLibrary>,
}

impl DynamicPlugin {
    /// Read metadata from the library.
    pub fn new(library: Arc<PluginLibrary>) -> Self {
        let entry = library.entry_points;
        // SAFETY: entry points were validated when the library was opened and
        // stay valid while `library` is alive.
        let (name, version, description) =
            unsafe { ((entry.name)(), (entry.version)(), (entry.description)()) };
        Self {
            name,
            version,
            description,
            library,
        }
    }

    pub fn library(&self) -> &Arc<PluginLibrary> {
        &self.library
    }
}

impl NativePlugin for DynamicPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn initialize(&mut self, capability: HostCapability) -> Result<(), NativeError> {
        // SAFETY: see `DynamicPlugin::new`.
        unsafe { (self.library.entry_points.initialize)(capability) }
    }

    fn exports(&self) -> ExportTable {
        // SAFETY: see `DynamicPlugin::new`.
        unsafe { (self.library.entry_points.exports)() }
    }

    fn dispose(&mut self) -> Result<(), NativeError> {
        // SAFETY: see `DynamicPlugin::new`.
        unsafe { (self.library.entry_points.dispose)() }
    }
}

/// Plugin loader for managing dynamic plugin loading
///
/// Libraries are cached by canonical path, so each one is opened at most once
/// per process.
pub struct PluginLoader {
    /// Loaded libraries
    libraries: HashMap<PathBuf, Arc<PluginLibrary>>,
    /// Plugin search paths
    search_paths: Vec<PathBuf>,
    /// Expected API version
    api_version: u32,
}

impl PluginLoader {
    /// Current API version
    pub const CURRENT_API_VERSION: u32 = API_VERSION;

    pub fn new() -> Self {
        Self {
            libraries: HashMap::new(),
            search_paths: Vec::new(),
            api_version: Self::CURRENT_API_VERSION,
        }
    }

    /// Add a search path for plugins
    pub fn add_search_path<P: AsRef<Path>>(&mut self, path: P) {
        self.search_paths.push(path.as_ref().to_path_buf());
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Calculate file hash
    pub fn calculate_hash(path: &Path) -> Result<String, LoadError> {
        let contents = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&contents);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Find a plugin file by plugin name or file path
    pub fn find_plugin(&self, name: &str) -> Option<PathBuf> {
        let direct_path = PathBuf::from(name);
        if direct_path.is_file() {
            return Some(direct_path);
        }

        let lib_name = library_file_name(name);
        self.search_paths
            .iter()
            .flat_map(|dir| [dir.join(name), dir.join(&lib_name)])
            .chain(std::iter::once(PathBuf::from(&lib_name)))
            .find(|candidate| candidate.is_file())
    }

    /// Open a plugin library, or return the already opened one
    pub fn load_library<P: AsRef<Path>>(&mut self, path: P) -> Result<Arc<PluginLibrary>, LoadError> {
        let path = std::fs::canonicalize(path.as_ref()).map_err(|e| LoadError::LibraryOpen {
            path: path.as_ref().to_path_buf(),
            message: e.to_string(),
        })?;

        if let Some(lib) = self.libraries.get(&path) {
            debug!("Plugin library already open: {:?}", path);
            return Ok(lib.clone());
        }

        info!("Loading plugin library: {:?}", path);
        let hash = Self::calculate_hash(&path)?;

        // SAFETY: loading a library runs its initialisers; plugins are trusted.
        let library = unsafe { Library::new(&path) }.map_err(|e| LoadError::LibraryOpen {
            path: path.clone(),
            message: e.to_string(),
        })?;

        // SAFETY: symbols are only resolved here, and called after validation.
        let api_version = unsafe {
            match library.get::<ApiVersionFn>(symbols::API_VERSION.as_bytes()) {
                Ok(func) => func(),
                Err(_) => 1,
            }
        };
        if api_version != self.api_version {
            return Err(LoadError::VersionMismatch {
                expected: self.api_version,
                actual: api_version,
            });
        }

        validate_entry_points(&path, |symbol| unsafe {
            library.get::<*const ()>(symbol.as_bytes()).is_ok()
        })?;
        let entry_points = unsafe { resolve_entry_points(&library, &path)? };

        let plugin_lib = Arc::new(PluginLibrary {
            path: path.clone(),
            hash,
            loaded_at: Instant::now(),
            api_version,
            entry_points,
            library,
        });
        self.libraries.insert(path, plugin_lib.clone());
        Ok(plugin_lib)
    }

    /// Drop the loader's handle. The library is unmapped once nothing else
    /// (e.g. an installed export) holds it.
    pub fn release<P: AsRef<Path>>(&mut self, path: P) -> bool {
        let removed = self.libraries.remove(path.as_ref());
        if let Some(lib) = &removed {
            info!(
                "Released plugin library: {:?} ({} other holders)",
                lib.path,
                Arc::strong_count(lib) - 1
            );
        }
        removed.is_some()
    }

    pub fn list_libraries(&self) -> Vec<PathBuf> {
        self.libraries.keys().cloned().collect()
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

unsafe fn resolve_entry_points(library: &Library, path: &Path) -> Result<EntryPoints, LoadError> {
    fn get<T: Copy>(library: &Library, path: &Path, symbol: &str) -> Result<T, LoadError> {
        // SAFETY: the caller upholds the entry-point signature contract.
        unsafe { library.get::<T>(symbol.as_bytes()) }
            .map(|s| *s)
            .map_err(|_| LoadError::MissingEntryPoint {
                path: path.to_path_buf(),
                symbol: symbol.to_string(),
            })
    }

    Ok(EntryPoints {
        name: get(library, path, symbols::NAME)?,
        version: get(library, path, symbols::VERSION)?,
        description: get(library, path, symbols::DESCRIPTION)?,
        initialize: get(library, path, symbols::INITIALIZE)?,
        exports: get(library, path, symbols::EXPORTS)?,
        dispose: get(library, path, symbols::DISPOSE)?,
    })
}
