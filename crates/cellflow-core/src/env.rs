//! Shared variable environment threaded through the cells of one run.
//!
//! Every value must survive a JSON round trip, because script cells receive
//! the environment through a file and hand it back the same way.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Reserved key that, when `true`, makes every following query cell skip.
pub const SKIP_SQL_KEY: &str = "_skipSql";

/// Ordered `name -> JSON value` mapping shared across the cells of one run.
///
/// Insertion order is preserved so that snapshots render the way the cells
/// populated them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableEnvironment {
    vars: Map<String, Value>,
}

impl VariableEnvironment {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an environment from an existing JSON object.
    pub fn from_map(vars: Map<String, Value>) -> Self {
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Insert or overwrite a variable, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.vars.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.shift_remove(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.vars.keys()
    }

    /// Merge the top-level entries of `entries`, overwriting existing keys.
    pub fn merge_object(&mut self, entries: Map<String, Value>) {
        for (key, value) in entries {
            self.vars.insert(key, value);
        }
    }

    /// Whether query cells should currently be skipped.
    ///
    /// Only the JSON boolean `true` counts; `"true"` or `1` do not.
    pub fn skip_sql(&self) -> bool {
        matches!(self.vars.get(SKIP_SQL_KEY), Some(Value::Bool(true)))
    }

    pub fn set_skip_sql(&mut self, skip: bool) {
        self.vars.insert(SKIP_SQL_KEY.to_string(), Value::Bool(skip));
    }

    /// Owned copy for the variable-inspection surface.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.vars
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.vars
    }

    /// Parse an environment from a JSON object string.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let vars: Map<String, Value> = serde_json::from_str(text)?;
        Ok(Self { vars })
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.vars)?)
    }

    /// Write the environment as a UTF-8 JSON object.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    /// Read an environment previously written with [`write_to`](Self::write_to).
    pub fn read_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

impl FromIterator<(String, Value)> for VariableEnvironment {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}
