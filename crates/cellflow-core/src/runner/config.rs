//! Config cells: a JSON object merged into the environment.

use async_trait::async_trait;
use serde_json::Value;

use crate::cell::Cell;
use crate::context::RunContext;
use crate::error::Result;
use crate::result::RunResult;

use super::{CellOutcome, CellRunner};

#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigRunner;

impl ConfigRunner {
    pub fn new() -> Self {
        Self
    }

    /// Parse and merge without any async machinery.
    pub fn apply(&self, cell: &Cell, ctx: &RunContext<'_>) -> CellOutcome {
        if cell.text.trim().is_empty() {
            return CellOutcome::unchanged(RunResult::executed(""));
        }

        let entries = match serde_json::from_str::<Value>(&cell.text) {
            Ok(Value::Object(entries)) => entries,
            Ok(other) => {
                return CellOutcome::unchanged(RunResult::error(format!(
                    "Config cell must contain a JSON object, found {}",
                    json_kind(&other)
                )));
            }
            Err(e) => {
                return CellOutcome::unchanged(RunResult::error(format!(
                    "Invalid JSON in config cell: {}",
                    e
                )));
            }
        };

        tracing::debug!(
            "Config cell {} sets {} variable(s)",
            cell.index,
            entries.len()
        );

        let mut env = ctx.env.clone();
        env.merge_object(entries);
        CellOutcome::with_env(RunResult::executed(""), env)
    }
}

#[async_trait]
impl CellRunner for ConfigRunner {
    async fn run(&self, cell: &Cell, ctx: &RunContext<'_>) -> Result<CellOutcome> {
        Ok(self.apply(cell, ctx))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
