//! Plugin registry
//!
//! Tracks every plugin the host has seen, in load order, with its lifecycle
//! state. Owned by the host thread; no locking.

use crate::error::{PluginError, PluginResult};
use crate::loader::PluginLibrary;
use gode_kernel::{NativePlugin, PluginState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Plugin version information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Pre-release tag (e.g., "alpha", "beta")
    pub prerelease: Option<String>,
    /// Build metadata
    pub build: Option<String>,
}

impl PluginVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
            build: None,
        }
    }

    /// Parse from string (e.g., "1.2.3-alpha+build123")
    pub fn parse(version: &str) -> Result<Self, String> {
        let version = version.trim();

        let (version_pre, build) = match version.split_once('+') {
            Some((head, build)) => (head, Some(build.to_string())),
            None => (version, None),
        };
        let (version_core, prerelease) = match version_pre.split_once('-') {
            Some((core, pre)) => (core, Some(pre.to_string())),
            None => (version_pre, None),
        };

        let parts: Vec<&str> = version_core.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(format!("Invalid version format: {}", version));
        }

        let number = |part: &str, what: &str| {
            part.parse::<u32>()
                .map_err(|_| format!("Invalid {} version: {}", what, part))
        };
        let major = number(parts[0], "major")?;
        let minor = number(parts[1], "minor")?;
        let patch = match parts.get(2) {
            Some(part) => number(*part, "patch")?,
            None => 0,
        };

        Ok(Self {
            major,
            minor,
            patch,
            prerelease,
            build,
        })
    }

    /// Same major version.
    pub fn is_compatible(&self, other: &PluginVersion) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.prerelease {
            write!(f, "-{}", pre)?;
        }
        if let Some(ref build) = self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl Default for PluginVersion {
    fn default() -> Self {
        Self::new(0, 0, 0)
    }
}

/// What the host knows about one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique per activation (uuid v7, so ids sort by load time)
    pub id: String,
    pub name: String,
    /// Declared version string, as the plugin reported it
    pub version: String,
    /// Parsed version, when the declared string is well formed
    pub parsed_version: Option<PluginVersion>,
    pub description: String,
    /// `None` for in-process plugins
    pub library_path: Option<PathBuf>,
    /// SHA-256 of the library file
    pub file_hash: Option<String>,
    pub loaded_at: SystemTime,
    pub state: PluginState,
    /// Export names, once installed
    pub exports: Vec<String>,
}

impl PluginDescriptor {
    pub fn new(plugin: &dyn NativePlugin) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            name: plugin.name().to_string(),
            version: plugin.version().to_string(),
            parsed_version: PluginVersion::parse(plugin.version()).ok(),
            description: plugin.description().to_string(),
            library_path: None,
            file_hash: None,
            loaded_at: SystemTime::now(),
            state: PluginState::Discovered,
            exports: Vec::new(),
        }
    }

    pub fn with_library(mut self, library: &PluginLibrary) -> Self {
        self.library_path = Some(library.path().to_path_buf());
        self.file_hash = Some(library.hash().to_string());
        self
    }

    pub fn is_active(&self) -> bool {
        self.state == PluginState::Active
    }

    /// Validated state change.
    pub fn transition(&mut self, next: PluginState) -> PluginResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(PluginError::InvalidState {
                plugin: self.name.clone(),
                actual: self.state,
                requested: next,
            });
        }
        debug!(plugin = %self.name, from = %self.state, to = %next, "plugin state change");
        self.state = next;
        Ok(())
    }
}

/// A registered plugin and the handles that keep it alive.
pub struct PluginEntry {
    pub descriptor: PluginDescriptor,
    pub(crate) plugin: Option<Box<dyn NativePlugin>>,
    pub(crate) library: Option<Arc<PluginLibrary>>,
}

/// Plugin registry, in load order.
#[derive(Default)]
pub struct PluginRegistry {
    entries: Vec<PluginEntry>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin in the `Discovered` state. Returns its index.
    pub(crate) fn register(
        &mut self,
        plugin: Box<dyn NativePlugin>,
        library: Option<Arc<PluginLibrary>>,
    ) -> usize {
        let mut descriptor = PluginDescriptor::new(plugin.as_ref());
        if let Some(library) = &library {
            descriptor = descriptor.with_library(library);
        }
        self.entries.push(PluginEntry {
            descriptor,
            plugin: Some(plugin),
            library,
        });
        self.entries.len() - 1
    }

    pub(crate) fn entry_mut(&mut self, index: usize) -> Option<&mut PluginEntry> {
        self.entries.get_mut(index)
    }

    pub fn get(&self, name: &str) -> Option<&PluginDescriptor> {
        self.entries
            .iter()
            .rev()
            .map(|e| &e.descriptor)
            .find(|d| d.name == name)
    }

    /// Index of the live (not disposed) entry opened from `path`.
    pub fn index_by_path(&self, path: &Path) -> Option<usize> {
        self.entries.iter().position(|e| {
            !e.descriptor.state.is_terminal() && e.descriptor.library_path.as_deref() == Some(path)
        })
    }

    /// Another live plugin, not at `except`, already uses `name`.
    pub fn name_taken(&self, name: &str, except: usize) -> bool {
        self.entries.iter().enumerate().any(|(i, e)| {
            i != except
                && e.descriptor.name == name
                && matches!(
                    e.descriptor.state,
                    PluginState::Initialized | PluginState::Active
                )
        })
    }

    /// Descriptors in load order.
    pub fn list(&self) -> Vec<&PluginDescriptor> {
        self.entries.iter().map(|e| &e.descriptor).collect()
    }

    pub fn find_by_state(&self, state: PluginState) -> Vec<&PluginDescriptor> {
        self.entries
            .iter()
            .map(|e| &e.descriptor)
            .filter(|d| d.state == state)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
