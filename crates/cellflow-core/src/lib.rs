//! Core engine for Cellflow sequential notebook runs.
//!
//! This crate provides:
//! - A shared variable environment threaded through the cells of a run
//! - Query, config and script cell runners
//! - Bind-parameter rewriting and rule evaluation for query results
//! - Per-run isolated workspaces for script processes
//! - An execution controller with cooperative and forced interruption

pub mod cell;
pub mod context;
pub mod controller;
pub mod env;
pub mod error;
pub mod query;
pub mod result;
pub mod rules;
pub mod runner;
pub mod source;
pub mod workspace;

pub use cell::{Cell, CellKind, CellMetadata};
pub use context::{
    AbortHandle, ActiveHandle, ActiveSlot, ExecutionCallback, NoopCallback, ProcessKillHandle,
    RunContext, RunMode,
};
pub use controller::{
    CellRecord, ControllerConfig, ExecutionController, InterruptHandle, NotebookContext, RunReport,
};
pub use env::{SKIP_SQL_KEY, VariableEnvironment};
pub use error::{Error, Result};
pub use query::{BindError, NormalizedQuery, ParamStyle, normalize_query};
pub use result::{ResultMetadata, ResultPayload, RunResult, RunStatus};
pub use rules::{RuleDefinition, RuleStore, RuleSummary, run_rule_engine};
pub use runner::{CellOutcome, CellRunner, ConfigRunner, QueryRunner, ScriptRunner, ScriptRunnerConfig};
pub use source::{
    ColumnKey, ColumnType, DataSourceRegistry, DataSourceResolver, Driver, DriverError,
    ResultSet, Row, StatementKind, TransactionControl,
};
pub use workspace::IsolatedWorkspace;
