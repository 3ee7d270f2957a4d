//! Per-cell outcomes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::source::{ResultSet, StatementKind};

/// Final status of one cell execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Skipped,
    Executed,
    Error,
}

/// Structured payload attached to a query cell's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResultPayload {
    RowSet(ResultSet),
    Plan(ResultSet),
    AnalyzedPlan(ResultSet),
}

impl ResultPayload {
    pub fn result_set(&self) -> &ResultSet {
        match self {
            Self::RowSet(rs) | Self::Plan(rs) | Self::AnalyzedPlan(rs) => rs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<StatementKind>,
    pub payload: ResultPayload,
}

impl ResultMetadata {
    /// Metadata for a query's row set, carrying its table name and kind.
    pub fn row_set(rs: ResultSet) -> Self {
        Self {
            table_name: rs.meta.table_name.clone(),
            statement: Some(rs.meta.statement),
            payload: ResultPayload::RowSet(rs),
        }
    }

    pub fn plan(rs: ResultSet) -> Self {
        Self {
            table_name: None,
            statement: None,
            payload: ResultPayload::Plan(rs),
        }
    }

    pub fn analyzed_plan(rs: ResultSet) -> Self {
        Self {
            table_name: None,
            statement: None,
            payload: ResultPayload::AnalyzedPlan(rs),
        }
    }

    pub fn rows(&self) -> Option<&ResultSet> {
        match &self.payload {
            ResultPayload::RowSet(rs) => Some(rs),
            _ => None,
        }
    }
}

/// Outcome of one cell execution. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResultMetadata>,
    /// Non-fatal problems (rule failures, variables dropped at the process boundary).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Global, monotonically increasing execution counter; set by the controller.
    #[serde(default)]
    pub execution_order: u64,
    #[serde(default)]
    pub elapsed: Duration,
}

impl RunResult {
    fn with_status(status: RunStatus) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            status,
            metadata: None,
            warnings: Vec::new(),
            execution_order: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn skipped() -> Self {
        Self::with_status(RunStatus::Skipped)
    }

    pub fn executed(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::with_status(RunStatus::Executed)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            stderr: message.into(),
            ..Self::with_status(RunStatus::Error)
        }
    }

    pub fn with_metadata(mut self, metadata: ResultMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Whether a host should render the cell as succeeded.
    pub fn is_success(&self) -> bool {
        self.status != RunStatus::Error && self.stderr.is_empty()
    }
}
