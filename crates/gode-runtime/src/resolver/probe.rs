//! File system probing used by the resolver.

use std::path::Path;

/// Answers "does this file exist" for the resolver.
pub trait FileProbe: Send + Sync {
    fn is_file(&self, path: &Path) -> bool;
}

/// Probes the real file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl FileProbe for FsProbe {
    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }
}
