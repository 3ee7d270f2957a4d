//! Error types for cellflow-core.

use thiserror::Error;

use crate::query::BindError;
use crate::source::DriverError;

/// Result type for cellflow-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cellflow-core.
///
/// Most per-cell failures never surface as an `Error`: runners turn them into
/// an error-status [`RunResult`](crate::RunResult). Values of this type cross a
/// runner boundary only when something unexpected happens, and the controller
/// still records them against the cell instead of aborting the run.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The per-run isolated workspace could not be created or used.
    #[error("workspace error: {0}")]
    Workspace(String),

    /// No script interpreter could be located.
    #[error("interpreter not found: {0}")]
    Interpreter(String),

    /// Spawning or waiting on a script process failed.
    #[error("process error: {0}")]
    Process(String),

    /// A run is already active on this controller.
    #[error("a run is already in progress")]
    RunInProgress,

    /// A rule file could not be read or compiled.
    #[error("rule file error: {0}")]
    RuleFile(String),

    /// Bind parameter rewriting failed.
    #[error(transparent)]
    Bind(#[from] BindError),

    /// A data-source driver call failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl Error {
    /// A short suggestion for fixing the error, when one is known.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Interpreter(_) => Some(
                "install Node.js, pass --interpreter, or set CELLFLOW_SCRIPT_INTERPRETER",
            ),
            Self::RunInProgress => Some("wait for the active run to finish or interrupt it"),
            Self::Workspace(_) => Some("check that the temp directory is writable"),
            _ => None,
        }
    }

    /// The error message followed by its hint, if any.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}
