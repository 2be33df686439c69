//! Scratch file store.
//!
//! Scratch files are anonymous: they are unlinked immediately on creation,
//! so the kernel reclaims them when the last handle closes, even if the
//! process dies. All access goes through the open handle.

use std::fs::File;
use std::path::PathBuf;

/// A directory that hands out anonymous scratch files.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    dir: PathBuf,
}

impl ScratchDir {
    /// Use the given directory for scratch storage.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Use the system temporary directory.
    pub fn system() -> Self {
        Self {
            dir: std::env::temp_dir(),
        }
    }

    /// The backing directory.
    pub fn path(&self) -> &std::path::Path {
        &self.dir
    }

    /// Create a new empty anonymous file.
    pub fn create(&self) -> std::io::Result<File> {
        tempfile::tempfile_in(&self.dir)
    }
}
