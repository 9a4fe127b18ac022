//! Crate-level error types for `gode-runtime`.
//!
//! [`HostError`] composes the typed errors of every layer below the host;
//! [`HostResult`] carries them in an [`error_stack::Report`] so call sites
//! can attach context as the error travels up.
//!
//! ```rust,ignore
//! use error_stack::ResultExt;
//!
//! let value = host
//!     .run_file("main.rhai")
//!     .attach("running the entry script")?;
//! ```

use error_stack::Report;
use gode_kernel::config::ConfigError;
use gode_kernel::{LoadError, ResolutionError, ScriptException};
use gode_plugins::PluginError;
use thiserror::Error;

/// Errors surfaced by the script host.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HostError {
    /// A specifier could not be resolved.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// A module could not be loaded.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Plugin activation or a direct plugin call failed.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Script code raised and nothing caught it.
    #[error("Script error: {0}")]
    Script(ScriptException),

    /// Script source failed to compile.
    #[error("Compile error in {source_name}: {message}")]
    Compile { source_name: String, message: String },

    /// A module imported itself, directly or through other modules.
    #[error("Cyclic import: {}", chain.join(" -> "))]
    CyclicImport { chain: Vec<String> },

    /// The remote fetcher could not provide the module source.
    #[error("Failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    /// No built-in module is registered under that name.
    #[error("Unknown built-in module: {0}")]
    UnknownBuiltin(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The host was disposed.
    #[error("Script host has been disposed")]
    Disposed,
}

impl From<ScriptException> for HostError {
    fn from(exception: ScriptException) -> Self {
        HostError::Script(exception)
    }
}

/// Convenience result alias using [`error_stack::Report`].
///
/// Equivalent to `Result<T, error_stack::Report<HostError>>`.
pub type HostResult<T> = Result<T, Report<HostError>>;

/// Extension trait to convert `Result<T, E>` into [`HostResult<T>`].
pub trait IntoHostReport<T> {
    /// Wrap the error in an `error_stack::Report`.
    fn into_report(self) -> HostResult<T>;
}

impl<T, E: Into<HostError>> IntoHostReport<T> for Result<T, E> {
    #[inline]
    fn into_report(self) -> HostResult<T> {
        self.map_err(|e| Report::new(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use error_stack::ResultExt;
    use gode_kernel::ResolutionFailure;

    #[test]
    fn resolution_error_converts_via_from() {
        let err = ResolutionError::new("@x", "main.rhai", ResolutionFailure::Unresolvable);
        let host: HostError = err.into();

        assert!(matches!(host, HostError::Resolution(_)));
        assert!(host.to_string().contains("@x"));
    }

    #[test]
    fn report_carries_context() {
        let result: HostResult<()> = Err(LoadError::RemoteUnavailable("https://x".into()))
            .into_report()
            .attach("importing from main.rhai");

        let report = result.unwrap_err();
        assert!(matches!(report.current_context(), HostError::Load(_)));
        let rendered = format!("{report:?}");
        assert!(rendered.contains("https://x"));
        assert!(rendered.contains("importing from main.rhai"));
    }
}
