//! Rule evaluation over query results.
//!
//! A rule file names a table and an ordered list of rules. Each rule is a
//! condition tree stored with textual operands; before running, the tree is
//! compiled against the result's columns so operands get the column's type.
//! Every row a rule's condition matches is annotated with the rule's name.
//!
//! ```text
//! {
//!   "tableRule": {
//!     "tableName": "orders",
//!     "details": [
//!       { "ruleName": "negative total",
//!         "conditions": { "all": [ { "fact": "total", "operator": "lessThan", "value": "0" } ] },
//!         "error": { "column": "total", "limit": 100 } }
//!     ]
//!   }
//! }
//! ```

mod condition;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::source::{ResultSet, RuleAnnotation};

pub use condition::{CompiledCondition, Operand, Operator};

/// Conventional extension for rule files.
pub const RULE_FILE_EXTENSION: &str = "rrule";

/// Contents of a rule file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    pub table_rule: TableRule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRule {
    pub table_name: String,
    #[serde(default)]
    pub details: Vec<RuleDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDetail {
    pub rule_name: String,
    pub conditions: ConditionNode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RuleErrorTarget>,
}

/// Where a rule reports its hits, and how many rows it may annotate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleErrorTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Stored (uncompiled) condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionNode {
    All { all: Vec<ConditionNode> },
    Any { any: Vec<ConditionNode> },
    Leaf(LeafCondition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafCondition {
    pub fact: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ConditionParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// A rule bound to one result set.
#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    column: Option<String>,
    limit: Option<usize>,
    condition: CompiledCondition,
}

/// Counts reported by one rule-engine pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleSummary {
    pub rules: usize,
    pub rows: usize,
    pub annotations: usize,
}

impl std::fmt::Display for RuleSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} rules over {} rows, {} annotations",
            self.rules, self.rows, self.annotations
        )
    }
}

/// Compile every rule of `definition` against `rs` and annotate matching rows.
///
/// Compilation happens up front: a rule that does not fit the result's
/// columns fails the whole pass and leaves the rows untouched.
pub fn run_rule_engine(definition: &RuleDefinition, rs: &mut ResultSet) -> Result<RuleSummary> {
    let rules = definition
        .table_rule
        .details
        .iter()
        .map(|detail| {
            let condition = CompiledCondition::compile(&detail.conditions, rs).map_err(|e| {
                Error::RuleFile(format!("rule '{}': {}", detail.rule_name, e))
            })?;
            Ok(CompiledRule {
                name: detail.rule_name.clone(),
                column: detail.error.as_ref().and_then(|t| t.column.clone()),
                limit: detail.error.as_ref().and_then(|t| t.limit),
                condition,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut summary = RuleSummary {
        rules: rules.len(),
        rows: rs.rows.len(),
        annotations: 0,
    };

    for rule in &rules {
        let mut hits = 0;
        for row in rs.rows.iter_mut() {
            if rule.limit.is_some_and(|limit| hits >= limit) {
                break;
            }
            if rule.condition.matches(row) {
                row.annotations.push(RuleAnnotation {
                    rule_name: rule.name.clone(),
                    column: rule.column.clone(),
                });
                hits += 1;
            }
        }
        summary.annotations += hits;
    }

    Ok(summary)
}

/// Directory-backed access to rule files.
#[derive(Debug, Clone)]
pub struct RuleStore {
    base_dir: PathBuf,
}

impl RuleStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a rule reference to an existing file.
    ///
    /// Absolute references are used as-is; relative ones are looked up under
    /// the base directory, with the `.rrule` extension appended when the
    /// reference has none.
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        let direct = self.base_dir.join(name);
        if direct.is_file() {
            return Some(direct);
        }
        if direct.extension().is_none() {
            let with_ext = direct.with_extension(RULE_FILE_EXTENSION);
            if with_ext.is_file() {
                return Some(with_ext);
            }
        }
        None
    }

    pub fn exists(&self, name: &str) -> bool {
        self.locate(name).is_some()
    }

    /// Load a rule file; `Ok(None)` when it is not present.
    pub fn load(&self, name: &str) -> Result<Option<RuleDefinition>> {
        let Some(path) = self.locate(name) else {
            return Ok(None);
        };
        let text = fs::read_to_string(&path)?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let definition = serde_json::from_str(&text).map_err(|e| {
            Error::RuleFile(format!("{}: {}", path.display(), e))
        })?;
        Ok(Some(definition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ColumnKey, ColumnType, StatementKind};
    use serde_json::json;
    use tempfile::TempDir;

    fn orders() -> ResultSet {
        let mut rs = ResultSet::new(
            StatementKind::Select,
            vec![
                ColumnKey::new("id", ColumnType::Integer),
                ColumnKey::new("total", ColumnType::Float),
            ],
        );
        for (id, total) in [(1, 10.0), (2, -3.5), (3, -1.0), (4, 0.0)] {
            let Value::Object(map) = json!({"id": id, "total": total}) else {
                unreachable!()
            };
            rs.push_row(map);
        }
        rs
    }

    fn definition(limit: Option<usize>) -> RuleDefinition {
        serde_json::from_value(json!({
            "tableRule": {
                "tableName": "orders",
                "details": [{
                    "ruleName": "negative total",
                    "conditions": {"all": [
                        {"fact": "total", "operator": "lessThan", "value": "0"}
                    ]},
                    "error": {"column": "total", "limit": limit}
                }]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_engine_annotates_matching_rows() {
        let mut rs = orders();
        let summary = run_rule_engine(&definition(None), &mut rs).unwrap();

        assert_eq!(summary.annotations, 2);
        assert_eq!(rs.annotated_row_count(), 2);
        assert_eq!(rs.rows[1].annotations[0].rule_name, "negative total");
        assert_eq!(rs.rows[1].annotations[0].column.as_deref(), Some("total"));
        assert!(rs.rows[0].annotations.is_empty());
    }

    #[test]
    fn test_engine_respects_limit() {
        let mut rs = orders();
        let summary = run_rule_engine(&definition(Some(1)), &mut rs).unwrap();
        assert_eq!(summary.annotations, 1);
        assert_eq!(rs.annotated_row_count(), 1);
    }

    #[test]
    fn test_bad_rule_leaves_rows_untouched() {
        let mut rs = orders();
        let mut def = definition(None);
        def.table_rule.details[0].conditions = serde_json::from_value(json!(
            {"fact": "missing", "operator": "equal", "value": 1}
        ))
        .unwrap();

        let err = run_rule_engine(&def, &mut rs).unwrap_err();
        assert!(err.to_string().contains("negative total"));
        assert_eq!(rs.annotated_row_count(), 0);
    }

    #[test]
    fn test_store_locates_with_and_without_extension() {
        let temp = TempDir::new().unwrap();
        let text = serde_json::to_string(&definition(None)).unwrap();
        fs::write(temp.path().join("orders.rrule"), text).unwrap();

        let store = RuleStore::new(temp.path());
        assert!(store.exists("orders.rrule"));
        assert!(store.exists("orders"));
        assert!(!store.exists("customers"));

        let loaded = store.load("orders").unwrap().unwrap();
        assert_eq!(loaded.table_rule.table_name, "orders");
        assert!(store.load("customers").unwrap().is_none());
    }

    #[test]
    fn test_store_reports_malformed_file() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("broken.rrule"), "{not json").unwrap();

        let store = RuleStore::new(temp.path());
        assert!(matches!(store.load("broken"), Err(Error::RuleFile(_))));
    }
}
