//! Scratch directories owned by a single run.
//!
//! Every directory handed out by [`Workspace::create_scratch_dir`] is removed
//! when the run finishes, whether it succeeded or not.

use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use tempfile::TempDir;

/// The default parent for scratch directories and converted images.
pub const DEFAULT_TMPROOT: &str = "/var/tmp";

/// Tracks the scratch directories created during a run.
#[derive(Debug)]
pub struct Workspace {
    root: Utf8PathBuf,
    dirs: RefCell<Vec<TempDir>>,
}

impl Workspace {
    /// Create a workspace whose scratch directories live under `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            dirs: Default::default(),
        }
    }

    /// Create a new world-writable scratch directory.
    ///
    /// The installer may drop privileges for parts of its work, so the
    /// directory is made accessible to everyone.
    #[context("Creating scratch directory in {}", self.root)]
    pub fn create_scratch_dir(&self) -> Result<Utf8PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix("ozite-")
            .tempdir_in(&self.root)?;
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf())?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o777))
            .with_context(|| format!("Setting permissions on {path}"))?;
        tracing::debug!("Created tempdir {path}");
        self.dirs.borrow_mut().push(dir);
        Ok(path)
    }

    /// Remove every scratch directory created so far.
    ///
    /// A failure to remove one directory doesn't prevent removing the rest;
    /// the first error is returned once all were attempted.
    pub fn cleanup(&self) -> Result<()> {
        let mut first_err = None;
        for dir in self.dirs.borrow_mut().drain(..) {
            let path = dir.path().display().to_string();
            tracing::debug!("Deleting tempdir {path}");
            if let Err(e) = dir.close() {
                tracing::warn!("Failed to remove {path}: {e}");
                if first_err.is_none() {
                    first_err = Some(anyhow::Error::new(e).context(format!("Removing {path}")));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!("Cleaning up scratch directories: {e:#}");
        }
    }
}
