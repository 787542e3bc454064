//! Per-instance workspace directories
//!
//! A workspace is a fresh, empty directory tree with conventional `run/` and
//! `logs/` subdirectories. It is owned by exactly one instance and removed on
//! teardown; removal is best-effort and never returns an error.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::{FixtureError, Result};

/// Subdirectory holding pid files
pub const RUN_DIR: &str = "run";
/// Subdirectory holding logs
pub const LOGS_DIR: &str = "logs";

/// Isolated directory tree owned by one instance
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    /// Present until the workspace is destroyed
    dir: Option<TempDir>,
    keep: bool,
}

impl Workspace {
    /// Create a fresh workspace under `root` (system temp dir when `None`)
    pub fn create(root: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix);

        let dir = match root {
            Some(root) => {
                fs::create_dir_all(root).map_err(|e| FixtureError::workspace(root, e))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| {
            let parent = root.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
            FixtureError::workspace(parent, e)
        })?;

        let path = dir.path().to_path_buf();
        for sub in [RUN_DIR, LOGS_DIR] {
            let sub_path = path.join(sub);
            fs::create_dir(&sub_path).map_err(|e| FixtureError::workspace(&sub_path, e))?;
        }

        debug!(workspace = %path.display(), "Workspace created");

        Ok(Self {
            path,
            dir: Some(dir),
            keep: false,
        })
    }

    /// Leave the directory on disk when the workspace is destroyed
    pub fn keep_on_destroy(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_dir(&self) -> PathBuf {
        self.path.join(RUN_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.path.join(LOGS_DIR)
    }

    /// Whether the directory is still owned (not yet destroyed)
    pub fn is_live(&self) -> bool {
        self.dir.is_some()
    }

    /// Write `contents` to `name` relative to the workspace root
    pub fn write_file(&self, name: impl AsRef<Path>, contents: &str) -> Result<PathBuf> {
        let target = self.path.join(name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| FixtureError::workspace(parent, e))?;
        }
        fs::write(&target, contents).map_err(|e| FixtureError::workspace(&target, e))?;
        Ok(target)
    }

    /// Recursively remove the workspace. Safe to call more than once.
    pub fn destroy(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };

        if self.keep {
            let kept = dir.into_path();
            info!(workspace = %kept.display(), "Keeping workspace");
            return;
        }

        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => debug!(workspace = %path.display(), "Workspace removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(workspace = %path.display(), "Workspace already gone");
            }
            Err(e) => {
                warn!(workspace = %path.display(), error = %e, "Failed to remove workspace");
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Last `lines` lines of a text file, empty if it cannot be read
pub fn tail(path: &Path, lines: usize) -> String {
    match fs::read_to_string(path) {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            all[start..].join("\n")
        }
        Err(_) => String::new(),
    }
}
