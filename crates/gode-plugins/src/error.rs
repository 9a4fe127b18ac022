//! Typed errors for the plugin sub-system.

use gode_kernel::{InitializationError, LoadError, PluginState, RuntimeBridgeError};
use thiserror::Error;

/// Result alias for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors that can occur while loading, activating or calling plugins.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// The library could not be opened or validated.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// `initialize` returned failure; the plugin stays `Loaded`.
    #[error(transparent)]
    Initialization(#[from] InitializationError),

    /// A call into an installed export failed synchronously.
    #[error(transparent)]
    Bridge(#[from] RuntimeBridgeError),

    /// An operation was attempted while the plugin was in an incompatible state.
    #[error("Plugin '{plugin}' not in valid state: cannot go from {actual} to {requested}")]
    InvalidState {
        plugin: String,
        actual: PluginState,
        requested: PluginState,
    },

    /// No active plugin or export with that name.
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// The manager was disposed; nothing can be activated any more.
    #[error("Plugin manager has been disposed")]
    ShutDown,

    /// The worker pool could not be started.
    #[error("Worker pool error: {0}")]
    Workers(String),
}
