use error_stack::Report;
use gode_kernel::ResolutionError;
use gode_kernel::config::ConfigError;
use gode_runtime::HostError;

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// Host failure, rendered with its full context chain.
    #[error("{0}")]
    Host(String),

    #[error("Timed out after {0} ms with work still pending")]
    Timeout(u64),

    #[error("{0} of {1} plugin libraries failed to load")]
    PluginsFailed(usize, usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<Report<HostError>> for CliError {
    fn from(report: Report<HostError>) -> Self {
        CliError::Host(format!("{report:?}"))
    }
}
