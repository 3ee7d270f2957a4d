//! Execution strategies, one per [`CellKind`](crate::CellKind).
//!
//! # Runners
//!
//! - **`QueryRunner`** - rewrites binds, calls a data-source driver in the
//!   requested [`RunMode`](crate::RunMode), then applies rule evaluation.
//! - **`ConfigRunner`** - merges a JSON object into the environment in-process.
//! - **`ScriptRunner`** - runs the cell in an interpreter process and reads
//!   the environment back through the run's isolated workspace.
//!
//! Every runner reports validation and execution failures as an error-status
//! [`RunResult`](crate::RunResult). An `Err` from [`CellRunner::run`] means
//! something unexpected broke; the controller records it against the cell and
//! moves on.

mod config;
mod query;
mod script;

use async_trait::async_trait;

use crate::cell::Cell;
use crate::context::RunContext;
use crate::env::VariableEnvironment;
use crate::error::Result;
use crate::result::RunResult;

pub use config::ConfigRunner;
pub use query::QueryRunner;
pub use script::{ScriptRunner, ScriptRunnerConfig, find_interpreter, sanitize_stderr};

/// What a runner hands back to the controller.
#[derive(Debug, Clone)]
pub struct CellOutcome {
    pub result: RunResult,
    /// Replacement environment for the following cells; `None` keeps the
    /// current one.
    pub env: Option<VariableEnvironment>,
}

impl CellOutcome {
    /// Outcome that leaves the environment unchanged.
    pub fn unchanged(result: RunResult) -> Self {
        Self { result, env: None }
    }

    pub fn with_env(result: RunResult, env: VariableEnvironment) -> Self {
        Self {
            result,
            env: Some(env),
        }
    }
}

/// Uniform contract every execution strategy implements.
#[async_trait]
pub trait CellRunner: Send + Sync {
    async fn run(&self, cell: &Cell, ctx: &RunContext<'_>) -> Result<CellOutcome>;
}
