//! Host configuration
//!
//! `gode.toml` (or `gode.yaml` / `gode.json`) describes the import map, the
//! dependency manifest, resolver and queue tuning, plugin search paths and
//! logging. Every section is optional.
//!
//! ## Features
//!
//! - Auto-detection of format from file extension
//! - Environment variable substitution (`${VAR}` and `$VAR` syntax)
//! - Relative paths in the file are relative to the file's directory

use config::{Config as Cfg, File, FileFormat};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// File names probed by [`HostConfig::discover`], in order.
pub const CONFIG_FILE_NAMES: [&str; 4] = ["gode.toml", "gode.yaml", "gode.yml", "gode.json"];

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Detect configuration format from file extension
///
/// # Supported Extensions
///
/// - YAML: `.yaml`, `.yml`
/// - TOML: `.toml`
/// - JSON: `.json`
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

static BRACED_VAR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok());

static SIMPLE_VAR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").ok());

/// Substitute environment variables in a string
///
/// Supports both `${VAR_NAME}` and `$VAR_NAME` syntax. Unset variables are left
/// as written.
pub fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();

    // Braced syntax first so `${A}B` is not read as `$A` followed by `}B`.
    if let Some(re) = BRACED_VAR.as_ref() {
        result = re
            .replace_all(&result, |caps: &regex::Captures| {
                std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
            })
            .to_string();
    }

    if let Some(re) = SIMPLE_VAR.as_ref() {
        result = re
            .replace_all(&result, |caps: &regex::Captures| {
                std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
            })
            .to_string();
    }

    result
}

/// Load configuration from a file
///
/// Automatically detects the format from the file extension and performs
/// environment variable substitution on the loaded content.
pub fn load_config<T>(path: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    from_str(&content, format)
}

/// Load configuration from a string with explicit format
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted_content = substitute_env_vars(content);

    let config = Cfg::builder()
        .add_source(File::from_str(&substituted_content, format))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    config
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

// ============================================================================
// 配置节
// Sections
// ============================================================================

/// 解析器配置
/// Resolver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Reserved namespaces for `"<namespace>:<name>"` built-ins.
    pub builtin_namespaces: Vec<String>,
    /// Script suffixes, without the dot, in probing order.
    pub script_extensions: Vec<String>,
    pub max_alias_depth: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            builtin_namespaces: vec!["gode".to_string()],
            script_extensions: vec!["rhai".to_string(), "js".to_string()],
            max_alias_depth: 16,
        }
    }
}

/// 插件配置
/// Plugin configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub search_paths: Vec<PathBuf>,
}

/// 操作队列配置
/// Operation queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Cross-thread channel capacity; `0` means unbounded.
    pub capacity: usize,
    /// How long the drain loop sleeps waiting for outstanding work.
    pub idle_poll_ms: u64,
    /// Worker threads for blocking plugin jobs.
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            idle_poll_ms: 5,
            workers: 4,
        }
    }
}

/// 日志配置
/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// 宿主配置
/// Host configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Import map: alias to target. Keys ending in `/` are prefix aliases.
    pub imports: BTreeMap<String, String>,
    /// Dependency manifest: package name to local path, native library or URL.
    pub dependencies: BTreeMap<String, String>,
    pub resolver: ResolverConfig,
    pub plugins: PluginsConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl HostConfig {
    /// Load from a file; its directory becomes [`base_dir`](Self::base_dir).
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let path_str = path
            .to_str()
            .ok_or_else(|| ConfigError::Invalid(format!("non UTF-8 path {}", path.display())))?;
        let mut config: HostConfig = load_config(path_str)?;

        let absolute = std::fs::canonicalize(path)?;
        config.base_dir = absolute.parent().map(Path::to_path_buf);
        config.validate()?;
        Ok(config)
    }

    /// Parse from a string.
    pub fn parse(content: &str, format: FileFormat, base_dir: Option<PathBuf>) -> ConfigResult<Self> {
        let mut config: HostConfig = from_str(content, format)?;
        config.base_dir = base_dir;
        config.validate()?;
        Ok(config)
    }

    /// Look for a configuration file in `dir`. Absent file means defaults.
    pub fn discover(dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let dir = dir.as_ref();
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Self::load(candidate);
            }
        }
        Ok(Self {
            base_dir: Some(dir.to_path_buf()),
            ..Self::default()
        })
    }

    /// Base directory, or the current directory when none was recorded.
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Plugin search paths made absolute against the base directory.
    pub fn plugin_search_paths(&self) -> Vec<PathBuf> {
        let base = self.base_dir();
        self.plugins
            .search_paths
            .iter()
            .map(|p| if p.is_absolute() { p.clone() } else { base.join(p) })
            .collect()
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.resolver.max_alias_depth == 0 {
            return Err(ConfigError::Invalid(
                "resolver.max_alias_depth must be at least 1".to_string(),
            ));
        }
        if let Some(ns) = self
            .resolver
            .builtin_namespaces
            .iter()
            .find(|ns| ns.is_empty() || ns.contains(':') || ns.contains('/'))
        {
            return Err(ConfigError::Invalid(format!(
                "invalid built-in namespace '{}'",
                ns
            )));
        }
        if let Some(target) = self.imports.get("") {
            return Err(ConfigError::Invalid(format!(
                "import alias for '{}' must not be empty",
                target
            )));
        }
        Ok(())
    }
}
