//! Per-run isolated workspace.
//!
//! Script cells exchange variables with their interpreter process through
//! files, and those files live in a temporary directory owned by one run:
//!
//! ```text
//! $TMPDIR/cellflow-XXXXXX/
//! ├── vars_in_1.json    # environment handed to script execution #1
//! ├── script_1.js       # generated wrapper for execution #1
//! ├── vars_out_1.json   # environment written back by execution #1
//! └── ...
//! ```
//!
//! Each execution gets a fresh sequence number, so an output file left over
//! from an earlier execution can never be mistaken for the current one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tempfile::TempDir;

use crate::error::{Error, Result};

/// File paths used by one script execution.
#[derive(Debug, Clone)]
pub struct ScriptFiles {
    pub input: PathBuf,
    pub output: PathBuf,
    pub script: PathBuf,
}

/// Exclusively-owned temporary directory for one run.
#[derive(Debug)]
pub struct IsolatedWorkspace {
    dir: Option<TempDir>,
    path: PathBuf,
    sequence: AtomicU64,
}

impl IsolatedWorkspace {
    /// Create a fresh workspace under the system temp directory.
    pub fn create(prefix: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .map_err(|e| Error::Workspace(format!("failed to create workspace: {}", e)))?;
        Ok(Self::from_temp_dir(dir))
    }

    /// Create a fresh workspace inside `parent`.
    pub fn create_in(parent: &Path, prefix: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(parent)
            .map_err(|e| {
                Error::Workspace(format!(
                    "failed to create workspace in {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        Ok(Self::from_temp_dir(dir))
    }

    fn from_temp_dir(dir: TempDir) -> Self {
        let path = dir.path().to_path_buf();
        tracing::debug!("Created isolated workspace {}", path.display());
        Self {
            dir: Some(dir),
            path,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate the file names for the next script execution.
    pub fn next_script_files(&self, extension: &str) -> ScriptFiles {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        ScriptFiles {
            input: self.path.join(format!("vars_in_{}.json", n)),
            output: self.path.join(format!("vars_out_{}.json", n)),
            script: self.path.join(format!("script_{}.{}", n, extension)),
        }
    }

    /// Remove the directory and everything in it.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub fn dispose(&mut self) -> Result<()> {
        match self.dir.take() {
            Some(dir) => {
                dir.close().map_err(|e| {
                    Error::Workspace(format!(
                        "failed to remove workspace {}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
                tracing::debug!("Removed isolated workspace {}", self.path.display());
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.dir.is_none()
    }
}
