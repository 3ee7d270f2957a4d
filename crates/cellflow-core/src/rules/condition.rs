//! Compiling stored rule conditions against a result's columns and
//! evaluating them row by row.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::source::{ColumnKey, ColumnType, ResultSet, Row};

use super::{ConditionNode, LeafCondition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    LessThan,
    LessThanInclusive,
    GreaterThan,
    GreaterThanInclusive,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl Operator {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "equal" => Self::Equal,
            "notEqual" => Self::NotEqual,
            "lessThan" => Self::LessThan,
            "lessThanInclusive" => Self::LessThanInclusive,
            "greaterThan" => Self::GreaterThan,
            "greaterThanInclusive" => Self::GreaterThanInclusive,
            "in" => Self::In,
            "notIn" => Self::NotIn,
            "isNull" => Self::IsNull,
            "isNotNull" => Self::IsNotNull,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Static(Value),
    List(Vec<Value>),
    Column(String),
}

/// A condition tree whose facts and operands are bound to concrete columns.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledCondition {
    All(Vec<CompiledCondition>),
    Any(Vec<CompiledCondition>),
    Leaf {
        column: String,
        operator: Operator,
        operand: Operand,
    },
}

impl CompiledCondition {
    /// Bind a stored condition tree to the columns of `rs`.
    pub fn compile(node: &ConditionNode, rs: &ResultSet) -> Result<Self> {
        match node {
            ConditionNode::All { all } => Ok(Self::All(
                all.iter().map(|n| Self::compile(n, rs)).collect::<Result<_>>()?,
            )),
            ConditionNode::Any { any } => Ok(Self::Any(
                any.iter().map(|n| Self::compile(n, rs)).collect::<Result<_>>()?,
            )),
            ConditionNode::Leaf(leaf) => compile_leaf(leaf, rs),
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::All(items) => items.iter().all(|c| c.matches(row)),
            Self::Any(items) => items.iter().any(|c| c.matches(row)),
            Self::Leaf {
                column,
                operator,
                operand,
            } => {
                let actual = row.get(column).unwrap_or(&Value::Null);
                evaluate(actual, *operator, operand, row)
            }
        }
    }
}

fn compile_leaf(leaf: &LeafCondition, rs: &ResultSet) -> Result<CompiledCondition> {
    let key = rs
        .key(&leaf.fact)
        .ok_or_else(|| Error::RuleFile(format!("unknown column '{}'", leaf.fact)))?;
    let operator = Operator::parse(&leaf.operator)
        .ok_or_else(|| Error::RuleFile(format!("unknown operator '{}'", leaf.operator)))?;

    let by_column = leaf
        .params
        .as_ref()
        .filter(|p| p.val_type.as_deref() == Some("column"));

    let operand = match operator {
        Operator::IsNull | Operator::IsNotNull => Operand::None,
        _ if by_column.is_some() => {
            let name = by_column
                .and_then(|p| p.val_column.clone())
                .ok_or_else(|| Error::RuleFile("column operand without valColumn".into()))?;
            if rs.key(&name).is_none() {
                return Err(Error::RuleFile(format!("unknown column '{}'", name)));
            }
            Operand::Column(name)
        }
        Operator::In | Operator::NotIn => Operand::List(list_operand(&leaf.value, key)?),
        _ => Operand::Static(coerce(&leaf.value, key)?),
    };

    Ok(CompiledCondition::Leaf {
        column: key.name.clone(),
        operator,
        operand,
    })
}

fn list_operand(value: &Value, key: &ColumnKey) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => items.iter().map(|v| coerce(v, key)).collect(),
        Value::String(text) => text
            .split(',')
            .map(|part| coerce(&Value::String(part.trim().to_string()), key))
            .collect(),
        other => Ok(vec![coerce(other, key)?]),
    }
}

/// Convert a textual operand into the column's type.
fn coerce(value: &Value, key: &ColumnKey) -> Result<Value> {
    let Value::String(text) = value else {
        return Ok(value.clone());
    };
    let invalid = || {
        Error::RuleFile(format!(
            "value '{}' is not valid for column '{}'",
            text, key.name
        ))
    };

    match key.column_type {
        ColumnType::Integer | ColumnType::Float => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(invalid),
        ColumnType::Boolean => match text.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(invalid()),
        },
        _ => Ok(value.clone()),
    }
}

fn evaluate(actual: &Value, operator: Operator, operand: &Operand, row: &Row) -> bool {
    let expected = match operand {
        Operand::None => None,
        Operand::Static(v) => Some(v),
        Operand::Column(name) => Some(row.get(name).unwrap_or(&Value::Null)),
        Operand::List(items) => {
            let found = items.iter().any(|v| compare(actual, v) == Some(Ordering::Equal));
            return match operator {
                Operator::In => found,
                Operator::NotIn => !found,
                _ => false,
            };
        }
    };

    match (operator, expected) {
        (Operator::IsNull, _) => actual.is_null(),
        (Operator::IsNotNull, _) => !actual.is_null(),
        (_, None) => false,
        (Operator::Equal, Some(e)) => compare(actual, e) == Some(Ordering::Equal),
        (Operator::NotEqual, Some(e)) => compare(actual, e) != Some(Ordering::Equal),
        (Operator::LessThan, Some(e)) => compare(actual, e) == Some(Ordering::Less),
        (Operator::LessThanInclusive, Some(e)) => {
            matches!(compare(actual, e), Some(Ordering::Less | Ordering::Equal))
        }
        (Operator::GreaterThan, Some(e)) => compare(actual, e) == Some(Ordering::Greater),
        (Operator::GreaterThanInclusive, Some(e)) => {
            matches!(compare(actual, e), Some(Ordering::Greater | Ordering::Equal))
        }
        (Operator::In | Operator::NotIn, Some(_)) => false,
    }
}

/// Order two JSON scalars. Numbers compare numerically, including numeric
/// strings against numbers; mismatched kinds are unordered.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => {
            let x = as_f64(a)?;
            let y = as_f64(b)?;
            x.partial_cmp(&y)
        }
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result_set() -> ResultSet {
        let mut rs = ResultSet::new(
            crate::source::StatementKind::Select,
            vec![
                ColumnKey::new("id", ColumnType::Integer),
                ColumnKey::new("status", ColumnType::Text),
                ColumnKey::new("limit", ColumnType::Integer),
                ColumnKey::new("active", ColumnType::Boolean),
            ],
        );
        for row in [
            json!({"id": 1, "status": "open", "limit": 5, "active": true}),
            json!({"id": 9, "status": "closed", "limit": 3, "active": false}),
            json!({"id": 4, "status": null, "limit": 4, "active": true}),
        ] {
            let Value::Object(map) = row else { unreachable!() };
            rs.push_row(map);
        }
        rs
    }

    fn node(value: Value) -> ConditionNode {
        serde_json::from_value(value).unwrap()
    }

    fn matching_ids(cond: &CompiledCondition, rs: &ResultSet) -> Vec<i64> {
        rs.rows
            .iter()
            .filter(|r| cond.matches(r))
            .map(|r| r.get("id").and_then(Value::as_i64).unwrap())
            .collect()
    }

    #[test]
    fn test_textual_number_is_coerced() {
        let rs = result_set();
        let cond = CompiledCondition::compile(
            &node(json!({"fact": "id", "operator": "greaterThan", "value": "3"})),
            &rs,
        )
        .unwrap();
        assert_eq!(matching_ids(&cond, &rs), vec![9, 4]);
    }

    #[test]
    fn test_in_list_from_text() {
        let rs = result_set();
        let cond = CompiledCondition::compile(
            &node(json!({"fact": "id", "operator": "in", "value": "1, 4"})),
            &rs,
        )
        .unwrap();
        assert_eq!(matching_ids(&cond, &rs), vec![1, 4]);
    }

    #[test]
    fn test_column_operand() {
        let rs = result_set();
        let cond = CompiledCondition::compile(
            &node(json!({
                "fact": "id",
                "operator": "greaterThanInclusive",
                "value": null,
                "params": {"valType": "column", "valColumn": "limit"}
            })),
            &rs,
        )
        .unwrap();
        assert_eq!(matching_ids(&cond, &rs), vec![9, 4]);
    }

    #[test]
    fn test_nested_any_all_and_null_checks() {
        let rs = result_set();
        let cond = CompiledCondition::compile(
            &node(json!({"any": [
                {"fact": "status", "operator": "isNull", "value": null},
                {"all": [
                    {"fact": "status", "operator": "equal", "value": "open"},
                    {"fact": "active", "operator": "equal", "value": "true"}
                ]}
            ]})),
            &rs,
        )
        .unwrap();
        assert_eq!(matching_ids(&cond, &rs), vec![1, 4]);
    }

    #[test]
    fn test_unknown_column_and_operator_fail_to_compile() {
        let rs = result_set();
        assert!(
            CompiledCondition::compile(
                &node(json!({"fact": "nope", "operator": "equal", "value": 1})),
                &rs
            )
            .is_err()
        );
        assert!(
            CompiledCondition::compile(
                &node(json!({"fact": "id", "operator": "like", "value": 1})),
                &rs
            )
            .is_err()
        );
        assert!(
            CompiledCondition::compile(
                &node(json!({"fact": "id", "operator": "equal", "value": "abc"})),
                &rs
            )
            .is_err()
        );
    }

    #[test]
    fn test_null_is_unordered_against_numbers() {
        let rs = result_set();
        let cond = CompiledCondition::compile(
            &node(json!({"fact": "status", "operator": "notEqual", "value": "open"})),
            &rs,
        )
        .unwrap();
        // null != "open" holds because the two are not equal
        assert_eq!(matching_ids(&cond, &rs), vec![9, 4]);
    }
}
