//! Query cells: bind rewriting, driver dispatch per run mode, and rule
//! evaluation over the returned rows.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cell::Cell;
use crate::context::{ActiveHandle, RunContext, RunMode};
use crate::error::Result;
use crate::query::normalize_query;
use crate::result::{ResultMetadata, ResultPayload, RunResult, RunStatus};
use crate::rules::{RuleStore, run_rule_engine};
use crate::source::{DataSourceResolver, Driver, ResultSet, StatementKind, TransactionControl};

use super::{CellOutcome, CellRunner};

const INTERRUPTED_MESSAGE: &str = "Query execution was interrupted";

/// Runs query cells against drivers supplied by a [`DataSourceResolver`].
///
/// Query cells never change the environment; they only read it to resolve
/// bind parameters.
pub struct QueryRunner {
    resolver: Arc<dyn DataSourceResolver>,
    rules: RuleStore,
}

impl QueryRunner {
    pub fn new(resolver: Arc<dyn DataSourceResolver>, rules: RuleStore) -> Self {
        Self { resolver, rules }
    }

    async fn execute(&self, cell: &Cell, ctx: &RunContext<'_>) -> RunResult {
        if ctx.env.skip_sql() {
            tracing::debug!("Skipping query cell {} (_skipSql)", cell.index);
            return RunResult::skipped();
        }

        let Some(name) = cell.metadata.connection_name.as_deref() else {
            return RunResult::error("Specify the connection name to be used.");
        };
        let Some(driver) = self.resolver.resolve(name) else {
            return RunResult::error(format!(
                "Missing connection {}. Available here [{}].",
                name,
                self.resolver.names().join(",")
            ));
        };

        let query = match normalize_query(&cell.text, ctx.env, driver.param_style()) {
            Ok(query) => query,
            Err(e) => return RunResult::error(e.to_string()),
        };
        tracing::debug!("query: {}", query.sql);
        tracing::debug!("binds: {:?}", query.binds);

        let outcome = {
            let _active = ctx.active.register(ActiveHandle::Session(driver.clone()));
            if ctx.is_interrupted() {
                tracing::info!("Query cell {} interrupted before it was sent", cell.index);
                return RunResult::error(INTERRUPTED_MESSAGE);
            }
            call_driver(driver.as_ref(), ctx.mode, &query.sql, &query.binds).await
        };

        match outcome {
            Ok(metadata) => RunResult::executed("").with_metadata(metadata),
            Err(message) => {
                tracing::error!("Query cell {} failed: {}", cell.index, message);
                RunResult::error(message)
            }
        }
    }

    /// Annotate a successful row-returning result using the cell's rule file.
    ///
    /// Failures become warnings; the result keeps its status.
    fn apply_rules(&self, cell: &Cell, mode: RunMode, result: &mut RunResult) {
        if mode != RunMode::Query || result.status != RunStatus::Executed {
            return;
        }
        let Some(rule_file) = cell.metadata.rule_file.as_deref() else {
            return;
        };
        let Some(metadata) = result.metadata.as_mut() else {
            return;
        };
        let ResultPayload::RowSet(rs) = &mut metadata.payload else {
            return;
        };
        if !rs.meta.statement.returns_rows() || !self.rules.exists(rule_file) {
            return;
        }

        let outcome = self
            .rules
            .load(rule_file)
            .and_then(|definition| match definition {
                Some(definition) => run_rule_engine(&definition, rs).map(Some),
                None => Ok(None),
            });

        match outcome {
            Ok(Some(summary)) => {
                tracing::info!("Rule engine on cell {}: {}", cell.index, summary);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Rule evaluation failed for cell {}: {}", cell.index, e);
                result
                    .warnings
                    .push(format!("Rule evaluation skipped: {}", e));
            }
        }
    }
}

async fn call_driver(
    driver: &dyn Driver,
    mode: RunMode,
    sql: &str,
    binds: &[serde_json::Value],
) -> std::result::Result<ResultMetadata, String> {
    match mode {
        RunMode::Query => driver
            .request_query(sql, binds)
            .await
            .map(|mut rs| {
                classify_if_unknown(&mut rs, sql);
                ResultMetadata::row_set(rs)
            })
            .map_err(|e| format!("Execute query Error: {}", e)),
        RunMode::Explain => driver
            .explain(sql, binds)
            .await
            .map(ResultMetadata::plan)
            .map_err(|e| format!("Explain Error: {}", e)),
        RunMode::ExplainAnalyze => driver
            .explain_analyze(sql, binds, TransactionControl::AlwaysRollback)
            .await
            .map(ResultMetadata::analyzed_plan)
            .map_err(|e| format!("Explain Analyze Error: {}", e)),
    }
}

/// Drivers that do not report a statement kind get one from the SQL text.
fn classify_if_unknown(rs: &mut ResultSet, sql: &str) {
    if rs.meta.statement == StatementKind::Other {
        rs.meta.statement = StatementKind::classify(sql);
    }
}

/// Give an unnamed row set a table name derived from the cell position.
fn fill_table_name(rs: &mut ResultSet, cell: &Cell) {
    if rs.meta.table_name.as_deref().is_none_or(str::is_empty) {
        rs.meta.table_name = Some(format!("CELL{}", cell.index + 1));
    }
}

#[async_trait]
impl CellRunner for QueryRunner {
    async fn run(&self, cell: &Cell, ctx: &RunContext<'_>) -> Result<CellOutcome> {
        let mut result = self.execute(cell, ctx).await;

        if let Some(metadata) = result.metadata.as_mut() {
            if let ResultPayload::RowSet(rs) = &mut metadata.payload {
                fill_table_name(rs, cell);
                metadata.table_name = rs.meta.table_name.clone();
            }
        }

        self.apply_rules(cell, ctx.mode, &mut result);
        Ok(CellOutcome::unchanged(result))
    }
}
