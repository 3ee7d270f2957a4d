//! Data-source contract used by query cells.
//!
//! Real drivers live outside this crate. The engine only needs to resolve a
//! driver by connection name and call it through [`Driver`].

mod resultset;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::query::ParamStyle;

pub use resultset::{
    ColumnKey, ColumnType, ResultSet, ResultSetMeta, Row, RuleAnnotation, StatementKind,
};

/// Failure reported by a driver, carried as its message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// How a driver must finish the transaction it opens for a diagnostic run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionControl {
    /// Roll back whatever happened, success or failure.
    AlwaysRollback,
}

/// A live connection to one data source.
///
/// Calls may be long-running; `kill` is invoked from another task while one
/// of the request methods is still awaiting.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Placeholder syntax this data source expects.
    fn param_style(&self) -> ParamStyle;

    /// Run a statement and return its rows.
    async fn request_query(&self, sql: &str, binds: &[Value]) -> Result<ResultSet, DriverError>;

    /// Return the plan for a statement without running it.
    async fn explain(&self, sql: &str, binds: &[Value]) -> Result<ResultSet, DriverError>;

    /// Run the statement under a plan analyzer inside a transaction finished
    /// according to `control`.
    async fn explain_analyze(
        &self,
        sql: &str,
        binds: &[Value],
        control: TransactionControl,
    ) -> Result<ResultSet, DriverError>;

    /// Kill the in-flight remote session, returning a diagnostic on failure.
    async fn kill(&self) -> Option<String>;
}

/// Looks up drivers by connection name.
pub trait DataSourceResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Driver>>;

    /// Names of every configured data source, for diagnostics.
    fn names(&self) -> Vec<String>;

    /// Connection settings visible to script cells, one object per data
    /// source. Each object carries at least a `name` entry.
    fn connection_settings(&self) -> Vec<Value> {
        self.names()
            .into_iter()
            .map(|name| serde_json::json!({ "name": name }))
            .collect()
    }
}

/// Name-keyed set of drivers.
#[derive(Default, Clone)]
pub struct DataSourceRegistry {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
    settings: BTreeMap<String, Map<String, Value>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        self.drivers.insert(name.into(), driver);
    }

    pub fn with(mut self, name: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        self.register(name, driver);
        self
    }

    /// Attach connection settings that scripts can read for `name`.
    ///
    /// Settings are handed to the script process as plain JSON, so keep
    /// secrets out of them.
    pub fn with_settings(mut self, name: impl Into<String>, settings: Map<String, Value>) -> Self {
        self.settings.insert(name.into(), settings);
        self
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl DataSourceResolver for DataSourceRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    fn connection_settings(&self) -> Vec<Value> {
        self.drivers
            .keys()
            .map(|name| {
                let mut settings = self.settings.get(name).cloned().unwrap_or_default();
                settings.insert("name".to_string(), Value::String(name.clone()));
                Value::Object(settings)
            })
            .collect()
    }
}
