//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::Notify;

use cellflow_core::{
    Cell, ColumnKey, ColumnType, Driver, DriverError, ExecutionCallback, ParamStyle, ResultSet,
    RunResult, StatementKind, TransactionControl, VariableEnvironment,
};

/// One call observed by [`MockDriver`].
#[derive(Debug, Clone, PartialEq)]
pub struct DriverCall {
    pub method: &'static str,
    pub sql: String,
    pub binds: Vec<Value>,
}

/// In-memory data source with a single `items` table.
///
/// `INSERT` statements append a row; anything else returns the current rows.
/// Diagnostic runs write into a scratch copy that is thrown away when the
/// transaction control says so.
pub struct MockDriver {
    style: ParamStyle,
    items: Mutex<Vec<Value>>,
    calls: Mutex<Vec<DriverCall>>,
    delay: Option<Duration>,
    untyped: bool,
    killed: AtomicBool,
    kill_signal: Notify,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            style: ParamStyle::QuestionMark,
            items: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
            untyped: false,
            killed: AtomicBool::new(false),
            kill_signal: Notify::new(),
        }
    }

    /// Make every request wait `delay` unless the session is killed first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report every row set with an unknown statement kind.
    pub fn untyped(mut self) -> Self {
        self.untyped = true;
        self
    }

    pub fn with_items(self, items: Vec<Value>) -> Self {
        *self.items.lock().unwrap() = items;
        self
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn committed_items(&self) -> Vec<Value> {
        self.items.lock().unwrap().clone()
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn record(&self, method: &'static str, sql: &str, binds: &[Value]) {
        self.calls.lock().unwrap().push(DriverCall {
            method,
            sql: sql.to_string(),
            binds: binds.to_vec(),
        });
    }

    async fn wait(&self) -> Result<(), DriverError> {
        let Some(delay) = self.delay else {
            return Ok(());
        };
        if self.was_killed() {
            return Err(DriverError::new("session was killed"));
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.kill_signal.notified() => Err(DriverError::new("session was killed")),
        }
    }

    fn apply(&self, sql: &str, binds: &[Value], items: &mut Vec<Value>) -> Result<ResultSet, DriverError> {
        let statement = if self.untyped {
            StatementKind::Other
        } else {
            StatementKind::classify(sql)
        };
        if sql.contains("FAIL") {
            return Err(DriverError::new("syntax error at or near \"FAIL\""));
        }
        if StatementKind::classify(sql) == StatementKind::Insert {
            items.push(binds.first().cloned().unwrap_or(Value::Null));
            return Ok(ResultSet::new(statement, Vec::new()));
        }
        Ok(items_result_set(statement, items))
    }
}

pub fn items_result_set(statement: StatementKind, items: &[Value]) -> ResultSet {
    let mut rs = ResultSet::new(statement, vec![
        ColumnKey::new("id", ColumnType::Integer),
        ColumnKey::new("name", ColumnType::Text),
    ]);
    for (i, item) in items.iter().enumerate() {
        let mut row = Map::new();
        row.insert("id".to_string(), json!(i + 1));
        row.insert("name".to_string(), item.clone());
        rs.push_row(row);
    }
    rs
}

#[async_trait]
impl Driver for MockDriver {
    fn param_style(&self) -> ParamStyle {
        self.style
    }

    async fn request_query(&self, sql: &str, binds: &[Value]) -> Result<ResultSet, DriverError> {
        self.record("query", sql, binds);
        self.wait().await?;
        let mut items = self.items.lock().unwrap();
        self.apply(sql, binds, &mut items)
    }

    async fn explain(&self, sql: &str, binds: &[Value]) -> Result<ResultSet, DriverError> {
        self.record("explain", sql, binds);
        self.wait().await?;
        let mut plan = ResultSet::new(StatementKind::Explain, vec![ColumnKey::new(
            "plan",
            ColumnType::Text,
        )]);
        let mut row = Map::new();
        row.insert("plan".to_string(), json!(format!("Seq Scan: {}", sql)));
        plan.push_row(row);
        Ok(plan)
    }

    async fn explain_analyze(
        &self,
        sql: &str,
        binds: &[Value],
        control: TransactionControl,
    ) -> Result<ResultSet, DriverError> {
        self.record("explain_analyze", sql, binds);
        self.wait().await?;
        let mut scratch = self.items.lock().unwrap().clone();
        let rs = self.apply(sql, binds, &mut scratch)?;
        match control {
            TransactionControl::AlwaysRollback => drop(scratch),
        }
        let mut plan = ResultSet::new(StatementKind::Explain, vec![ColumnKey::new(
            "plan",
            ColumnType::Text,
        )]);
        let mut row = Map::new();
        row.insert(
            "plan".to_string(),
            json!(format!("actual rows={}", rs.row_count())),
        );
        plan.push_row(row);
        Ok(plan)
    }

    async fn kill(&self) -> Option<String> {
        self.killed.store(true, Ordering::SeqCst);
        self.kill_signal.notify_one();
        None
    }
}

/// Callback that records every event it sees.
#[derive(Default)]
pub struct RecordingCallback {
    /// `("started" | "finished", index)` in the order the events arrived.
    pub events: Mutex<Vec<(&'static str, usize)>>,
    pub started: Mutex<Vec<usize>>,
    pub finished: Mutex<Vec<(usize, RunResult)>>,
    pub final_env: Mutex<Option<(VariableEnvironment, bool)>>,
}

impl RecordingCallback {
    pub fn finished_indices(&self) -> Vec<usize> {
        self.finished.lock().unwrap().iter().map(|(i, _)| *i).collect()
    }
}

impl ExecutionCallback for RecordingCallback {
    fn on_cell_started(&self, cell: &Cell) {
        self.events.lock().unwrap().push(("started", cell.index));
        self.started.lock().unwrap().push(cell.index);
    }

    fn on_cell_finished(&self, cell: &Cell, result: &RunResult) {
        self.events.lock().unwrap().push(("finished", cell.index));
        self.finished
            .lock()
            .unwrap()
            .push((cell.index, result.clone()));
    }

    fn on_run_finished(&self, variables: &VariableEnvironment, interrupted: bool) {
        *self.final_env.lock().unwrap() = Some((variables.clone(), interrupted));
    }
}

/// Path to `node`, or `None` (with a note on stderr) when it is not installed.
pub fn node() -> Option<std::path::PathBuf> {
    let found = which::which("node").ok();
    if found.is_none() {
        eprintln!("node not found on PATH, skipping");
    }
    found
}

pub fn sample_items() -> Vec<Value> {
    vec![json!("alpha"), json!("beta"), json!("gamma")]
}

pub fn arc<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
