//! Error taxonomy shared by every gode crate.
//!
//! Each failure domain gets its own typed error so call sites can decide scope:
//! resolution, loading and initialization errors surface synchronously at the
//! `import` site; bridge errors become script-visible exceptions (or travel the
//! async channel a success would have used); disposal errors are collected into
//! a [`DisposalReport`] and never abort teardown.

use crate::value::{ParamKind, Value};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Error returned by native plugin code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct NativeError {
    pub message: String,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for NativeError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for NativeError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Why a specifier could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResolutionFailure {
    /// No strategy matched.
    Unresolvable,
    /// An alias reappeared in its own substitution chain.
    AliasCycle { chain: Vec<String> },
    /// The substitution chain grew past the configured limit.
    DepthExceeded { limit: usize },
    /// The specifier was empty or whitespace.
    EmptySpecifier,
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionFailure::Unresolvable => write!(f, "unresolvable"),
            ResolutionFailure::AliasCycle { chain } => {
                write!(f, "alias cycle: {}", chain.join(" -> "))
            }
            ResolutionFailure::DepthExceeded { limit } => {
                write!(f, "alias substitution exceeded depth {}", limit)
            }
            ResolutionFailure::EmptySpecifier => write!(f, "empty specifier"),
        }
    }
}

/// A specifier could not be resolved by any strategy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot resolve '{specifier}' from '{referrer}': {reason}")]
pub struct ResolutionError {
    pub specifier: String,
    pub referrer: String,
    pub reason: ResolutionFailure,
}

impl ResolutionError {
    pub fn new(specifier: &str, referrer: &str, reason: ResolutionFailure) -> Self {
        Self {
            specifier: specifier.to_string(),
            referrer: referrer.to_string(),
            reason,
        }
    }

    pub fn is_cycle(&self) -> bool {
        matches!(self.reason, ResolutionFailure::AliasCycle { .. })
    }
}

// ============================================================================
// Loading and initialization
// ============================================================================

/// Opening or validating a plugin library failed. Fatal to that plugin only.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoadError {
    #[error("Failed to open library {}: {message}", path.display())]
    LibraryOpen { path: PathBuf, message: String },

    #[error("Required entry point '{symbol}' missing in {}", path.display())]
    MissingEntryPoint { path: PathBuf, symbol: String },

    #[error("API version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Plugin '{0}' is already active from another library")]
    DuplicateName(String),

    #[error("Invalid export '{export}' in plugin '{plugin}': {reason}")]
    InvalidExport {
        plugin: String,
        export: String,
        reason: String,
    },

    #[error("Remote module '{0}' cannot be loaded without a fetcher")]
    RemoteUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// `Initialize` returned failure. The plugin stays `Loaded`.
#[derive(Debug, Clone, Error)]
#[error("Plugin '{plugin}' failed to initialize: {source}")]
pub struct InitializationError {
    pub plugin: String,
    #[source]
    pub source: NativeError,
}

// ============================================================================
// Bridge
// ============================================================================

/// Marshalling failure or recovered native fault during an exported call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RuntimeBridgeError {
    #[error("{plugin}.{function}: expected {expected} arguments, got {actual}")]
    Arity {
        plugin: String,
        function: String,
        expected: usize,
        actual: usize,
    },

    #[error("{plugin}.{function}: argument {index} expected {expected}, got {actual}")]
    ArgumentType {
        plugin: String,
        function: String,
        index: usize,
        expected: ParamKind,
        actual: &'static str,
    },

    #[error("{plugin}.{function}: {message}")]
    Native {
        plugin: String,
        function: String,
        message: String,
    },

    #[error("{plugin}.{function}: native fault: {message}")]
    Fault {
        plugin: String,
        function: String,
        message: String,
    },

    #[error("{plugin}.{function}: plugin disposed")]
    PluginDisposed { plugin: String, function: String },
}

impl RuntimeBridgeError {
    pub fn plugin(&self) -> &str {
        match self {
            RuntimeBridgeError::Arity { plugin, .. }
            | RuntimeBridgeError::ArgumentType { plugin, .. }
            | RuntimeBridgeError::Native { plugin, .. }
            | RuntimeBridgeError::Fault { plugin, .. }
            | RuntimeBridgeError::PluginDisposed { plugin, .. } => plugin,
        }
    }

    pub fn function(&self) -> &str {
        match self {
            RuntimeBridgeError::Arity { function, .. }
            | RuntimeBridgeError::ArgumentType { function, .. }
            | RuntimeBridgeError::Native { function, .. }
            | RuntimeBridgeError::Fault { function, .. }
            | RuntimeBridgeError::PluginDisposed { function, .. } => function,
        }
    }

    /// Message without the `plugin.function` prefix.
    pub fn message(&self) -> String {
        match self {
            RuntimeBridgeError::Arity {
                expected, actual, ..
            } => format!("expected {} arguments, got {}", expected, actual),
            RuntimeBridgeError::ArgumentType {
                index,
                expected,
                actual,
                ..
            } => format!("argument {} expected {}, got {}", index, expected, actual),
            RuntimeBridgeError::Native { message, .. } => message.clone(),
            RuntimeBridgeError::Fault { message, .. } => format!("native fault: {}", message),
            RuntimeBridgeError::PluginDisposed { .. } => "plugin disposed".to_string(),
        }
    }
}

// ============================================================================
// Disposal
// ============================================================================

/// A single plugin's `Dispose` failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Plugin '{plugin}' failed to dispose: {message}")]
pub struct DisposalError {
    pub plugin: String,
    pub message: String,
}

/// Aggregate outcome of a full disposal pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisposalReport {
    /// Plugins in the order `Dispose` was invoked.
    pub disposed: Vec<String>,
    pub failures: Vec<DisposalError>,
}

impl DisposalReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_plugins(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.plugin.as_str()).collect()
    }

    pub fn merge(&mut self, other: DisposalReport) {
        self.disposed.extend(other.disposed);
        self.failures.extend(other.failures);
    }
}

impl fmt::Display for DisposalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "disposed {} plugin(s), {} failure(s)",
            self.disposed.len(),
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

// ============================================================================
// Script-visible exceptions and queued operation failures
// ============================================================================

/// An exception as the script sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptException {
    pub message: String,
    pub plugin: Option<String>,
    pub function: Option<String>,
    /// Value thrown by script code, when the exception originated there.
    pub thrown: Option<Value>,
}

impl ScriptException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            plugin: None,
            function: None,
            thrown: None,
        }
    }

    /// Exception carrying a script-thrown value.
    pub fn thrown(value: Value) -> Self {
        Self {
            message: value.to_string(),
            plugin: None,
            function: None,
            thrown: Some(value),
        }
    }

    /// The value a script `catch` block (or rejection handler) observes.
    pub fn to_value(&self) -> Value {
        if let Some(thrown) = &self.thrown {
            return thrown.clone();
        }
        let mut entries = vec![("message", Value::from(self.message.as_str()))];
        if let Some(plugin) = &self.plugin {
            entries.push(("plugin", Value::from(plugin.as_str())));
        }
        if let Some(function) = &self.function {
            entries.push(("function", Value::from(function.as_str())));
        }
        Value::map(entries)
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.plugin, &self.function) {
            (Some(plugin), Some(function)) => {
                write!(f, "[{}.{}] {}", plugin, function, self.message)
            }
            _ => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ScriptException {}

impl From<RuntimeBridgeError> for ScriptException {
    fn from(err: RuntimeBridgeError) -> Self {
        Self {
            message: err.message(),
            plugin: Some(err.plugin().to_string()),
            function: Some(err.function().to_string()),
            thrown: None,
        }
    }
}

/// A queued operation reported failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OperationError {
    #[error("script error: {0}")]
    Script(#[from] ScriptException),

    #[error("{0}")]
    Failed(String),
}
