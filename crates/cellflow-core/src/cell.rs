//! Notebook cells as seen by the execution engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The execution strategy a cell is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    /// Declarative data query run against a named data source.
    Query,
    /// Structured configuration merged straight into the environment.
    Config,
    /// General-purpose script run in an isolated interpreter process.
    Script,
}

impl CellKind {
    /// Classify a cell by its editor language id.
    pub fn from_language(language: &str) -> Option<Self> {
        match language.to_ascii_lowercase().as_str() {
            "sql" => Some(Self::Query),
            "json" => Some(Self::Config),
            "javascript" | "js" | "typescript" | "ts" => Some(Self::Script),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Config => "config",
            Self::Script => "script",
        }
    }
}

impl std::fmt::Display for CellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-cell metadata stored alongside the cell in the notebook document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CellMetadata {
    /// Name of the data source a query cell runs against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,

    /// Skip this cell entirely.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub mark_as_skip: bool,

    /// Rule file applied to a query cell's rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_file: Option<String>,

    /// Config cells only: apply before every other cell of the run.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub pre_execution: bool,

    /// Config cells only: the `markAsRunInOrderAtJsonCell` key written by
    /// existing notebooks. When present it overrides `pre_execution`: `true`
    /// keeps the cell in document order, `false` hoists it.
    #[serde(
        rename = "markAsRunInOrderAtJsonCell",
        skip_serializing_if = "Option::is_none"
    )]
    pub run_in_order: Option<bool>,

    /// Config cells only: metadata-only, never applied by a run.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deferred: bool,

    /// Display hint for hosts rendering column comments.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub show_comment: bool,

    /// Keys this engine does not interpret, kept for round-tripping.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One ordered, immutable unit of notebook content.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// Position in the notebook (0-based).
    pub index: usize,
    pub kind: CellKind,
    /// Raw cell body.
    pub text: String,
    pub metadata: CellMetadata,
}

impl Cell {
    pub fn new(index: usize, kind: CellKind, text: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            text: text.into(),
            metadata: CellMetadata::default(),
        }
    }

    pub fn query(index: usize, text: impl Into<String>) -> Self {
        Self::new(index, CellKind::Query, text)
    }

    pub fn config(index: usize, text: impl Into<String>) -> Self {
        Self::new(index, CellKind::Config, text)
    }

    pub fn script(index: usize, text: impl Into<String>) -> Self {
        Self::new(index, CellKind::Script, text)
    }

    pub fn with_metadata(mut self, metadata: CellMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_connection(mut self, name: impl Into<String>) -> Self {
        self.metadata.connection_name = Some(name.into());
        self
    }

    pub fn with_rule_file(mut self, name: impl Into<String>) -> Self {
        self.metadata.rule_file = Some(name.into());
        self
    }

    /// Whether a run should hoist this config cell ahead of the other cells.
    pub fn is_pre_execution(&self) -> bool {
        self.kind == CellKind::Config
            && self
                .metadata
                .run_in_order
                .map_or(self.metadata.pre_execution, |in_order| !in_order)
            && !self.metadata.deferred
            && !self.metadata.mark_as_skip
    }

    /// Whether a run should record this cell as skipped without dispatching it.
    pub fn is_skipped(&self) -> bool {
        self.metadata.mark_as_skip || (self.kind == CellKind::Config && self.metadata.deferred)
    }
}
