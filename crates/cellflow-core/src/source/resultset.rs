//! Typed tabular results returned by data-source drivers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Broad classification of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Select,
    Show,
    Insert,
    Update,
    Delete,
    Ddl,
    Explain,
    #[default]
    Other,
}

impl StatementKind {
    /// Classify by leading keyword, skipping whitespace and SQL comments.
    pub fn classify(sql: &str) -> Self {
        let keyword: String = strip_leading_comments(sql)
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_ascii_lowercase();

        match keyword.as_str() {
            "select" | "with" | "values" => Self::Select,
            "show" | "describe" | "desc" => Self::Show,
            "insert" => Self::Insert,
            "update" => Self::Update,
            "delete" => Self::Delete,
            "create" | "alter" | "drop" | "truncate" | "rename" => Self::Ddl,
            "explain" => Self::Explain,
            _ => Self::Other,
        }
    }

    /// Whether statements of this kind produce a row set worth annotating.
    pub fn returns_rows(&self) -> bool {
        matches!(self, Self::Select | Self::Show)
    }
}

fn strip_leading_comments(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start();
        if let Some(rest) = sql.strip_prefix("--") {
            sql = rest.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(rest) = sql.strip_prefix("/*") {
            sql = rest.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            return sql;
        }
    }
}

/// Declared type of a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    Json,
    #[default]
    Unknown,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }
}

/// Column metadata of a result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnKey {
    pub name: String,
    #[serde(default)]
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ColumnKey {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            comment: None,
        }
    }
}

/// A rule hit recorded against a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAnnotation {
    pub rule_name: String,
    /// Column the hit is reported against, if the rule names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

/// One result row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<RuleAnnotation>,
}

impl Row {
    pub fn new(values: Map<String, Value>) -> Self {
        Self {
            values,
            annotations: Vec::new(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSetMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default)]
    pub statement: StatementKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Row set with column metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub meta: ResultSetMeta,
    pub keys: Vec<ColumnKey>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn new(statement: StatementKind, keys: Vec<ColumnKey>) -> Self {
        Self {
            meta: ResultSetMeta {
                statement,
                ..Default::default()
            },
            keys,
            rows: Vec::new(),
        }
    }

    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.meta.table_name = Some(name.into());
        self
    }

    pub fn push_row(&mut self, values: Map<String, Value>) {
        self.rows.push(Row::new(values));
    }

    pub fn key(&self, name: &str) -> Option<&ColumnKey> {
        self.keys.iter().find(|k| k.name == name)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of rows carrying at least one rule annotation.
    pub fn annotated_row_count(&self) -> usize {
        self.rows.iter().filter(|r| !r.annotations.is_empty()).count()
    }
}
