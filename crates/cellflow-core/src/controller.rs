//! Sequential run loop over an ordered list of cells.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::cell::{Cell, CellKind};
use crate::context::{AbortHandle, ActiveSlot, ExecutionCallback, RunContext, RunMode};
use crate::env::VariableEnvironment;
use crate::error::{Error, Result};
use crate::result::RunResult;
use crate::rules::RuleStore;
use crate::runner::{
    CellOutcome, CellRunner, ConfigRunner, QueryRunner, ScriptRunner, ScriptRunnerConfig,
};
use crate::source::DataSourceResolver;
use crate::workspace::IsolatedWorkspace;

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Script interpreter; discovered on demand when `None`.
    pub interpreter: Option<PathBuf>,
    /// Directory rule files are resolved against.
    pub rules_dir: PathBuf,
    /// Name prefix for per-run workspace directories.
    pub workspace_prefix: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interpreter: None,
            rules_dir: PathBuf::from("."),
            workspace_prefix: "cellflow-".to_string(),
        }
    }
}

/// Result of one processed cell, in processing order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellRecord {
    pub index: usize,
    pub kind: CellKind,
    pub result: RunResult,
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub results: Vec<CellRecord>,
    /// An interrupt was raised during the run.
    pub interrupted: bool,
    /// Environment after the last processed cell.
    pub variables: VariableEnvironment,
}

impl RunReport {
    pub fn error_count(&self) -> usize {
        self.results
            .iter()
            .filter(|record| !record.result.is_success())
            .count()
    }
}

/// Flags a host uses to decide which inspection panels to show after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotebookContext {
    /// A script or config cell ran, so the environment is worth showing.
    pub visible_variables: bool,
    /// At least one query cell produced a row set.
    pub visible_result_sets: bool,
    pub has_query: bool,
}

impl NotebookContext {
    pub fn from_results(results: &[CellRecord]) -> Self {
        let mut ctx = Self::default();
        for record in results {
            match record.kind {
                CellKind::Query => {
                    ctx.has_query = true;
                    if record
                        .result
                        .metadata
                        .as_ref()
                        .and_then(|m| m.rows())
                        .is_some()
                    {
                        ctx.visible_result_sets = true;
                    }
                }
                CellKind::Config | CellKind::Script => {
                    if record.result.is_success() {
                        ctx.visible_variables = true;
                    }
                }
            }
        }
        ctx
    }
}

/// Cloneable handle for interrupting a controller's run from another task.
#[derive(Clone)]
pub struct InterruptHandle {
    abort: AbortHandle,
    active: ActiveSlot,
}

impl InterruptHandle {
    /// Stop the loop before the next cell and kill the in-flight operation.
    pub async fn interrupt(&self) {
        self.abort.abort();
        if let Some(handle) = self.active.current() {
            if let Some(diagnostic) = handle.terminate().await {
                tracing::warn!("Interrupt: {}", diagnostic);
            }
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.abort.is_aborted()
    }
}

/// Releases the run slot when dropped.
struct RunSlot<'a>(&'a AtomicBool);

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs cells one at a time, threading a [`VariableEnvironment`] through them.
///
/// At most one run is active per controller. Share it behind an `Arc` and use
/// [`interrupt_handle`](Self::interrupt_handle) to stop a run from elsewhere.
pub struct ExecutionController {
    config: ControllerConfig,
    query: QueryRunner,
    script: ScriptRunner,
    config_runner: ConfigRunner,
    abort: AbortHandle,
    active: ActiveSlot,
    running: AtomicBool,
    execution_order: AtomicU64,
    last_variables: Mutex<Option<VariableEnvironment>>,
}

impl ExecutionController {
    pub fn new(config: ControllerConfig, resolver: Arc<dyn DataSourceResolver>) -> Self {
        let rules = RuleStore::new(config.rules_dir.clone());
        let script = ScriptRunner::new(ScriptRunnerConfig {
            interpreter: config.interpreter.clone(),
        })
        .with_resolver(resolver.clone());
        Self {
            query: QueryRunner::new(resolver, rules),
            script,
            config_runner: ConfigRunner::new(),
            config,
            abort: AbortHandle::new(),
            active: ActiveSlot::new(),
            running: AtomicBool::new(false),
            execution_order: AtomicU64::new(0),
            last_variables: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            abort: self.abort.clone(),
            active: self.active.clone(),
        }
    }

    /// Interrupt the active run, if any.
    pub async fn interrupt(&self) {
        tracing::info!("Interrupt requested");
        self.interrupt_handle().interrupt().await;
    }

    /// Final environment of the last completed run.
    pub fn variables(&self) -> Option<VariableEnvironment> {
        match self.last_variables.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Execute `cells` in order.
    ///
    /// Fails only when another run is active or the workspace cannot be
    /// created; every per-cell failure is recorded in the report instead.
    pub async fn start_run(
        &self,
        cells: &[Cell],
        mode: RunMode,
        callback: &dyn ExecutionCallback,
    ) -> Result<RunReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::RunInProgress);
        }
        let _slot = RunSlot(&self.running);

        self.abort.reset();
        let mut workspace = IsolatedWorkspace::create(&self.config.workspace_prefix)?;
        tracing::info!("Starting run of {} cell(s) in {:?} mode", cells.len(), mode);

        let (results, env) = self.run_cells(cells, mode, &workspace, callback).await;
        let interrupted = self.abort.is_aborted();

        match self.last_variables.lock() {
            Ok(mut guard) => *guard = Some(env.snapshot()),
            Err(poisoned) => *poisoned.into_inner() = Some(env.snapshot()),
        }
        callback.on_run_finished(&env, interrupted);

        if let Err(e) = workspace.dispose() {
            tracing::warn!("{}", e);
        }

        tracing::info!(
            "Run finished: {} cell(s) processed{}",
            results.len(),
            if interrupted { ", interrupted" } else { "" }
        );

        Ok(RunReport {
            results,
            interrupted,
            variables: env,
        })
    }

    async fn run_cells(
        &self,
        cells: &[Cell],
        mode: RunMode,
        workspace: &IsolatedWorkspace,
        callback: &dyn ExecutionCallback,
    ) -> (Vec<CellRecord>, VariableEnvironment) {
        let mut env = VariableEnvironment::new();
        let mut results = Vec::with_capacity(cells.len());

        // Pre-execution config cells run first; their results wait for their
        // position in document order.
        let mut hoisted: Vec<Option<RunResult>> = vec![None; cells.len()];
        for (pos, cell) in cells.iter().enumerate() {
            if !cell.is_pre_execution() {
                continue;
            }
            if self.abort.is_aborted() {
                break;
            }
            hoisted[pos] = Some(self.dispatch(cell, mode, &mut env, workspace).await);
        }

        // Once interrupted, only results that already exist are recorded.
        let mut stopped = false;
        for (pos, cell) in cells.iter().enumerate() {
            let result = match hoisted[pos].take() {
                Some(result) => {
                    callback.on_cell_started(cell);
                    result
                }
                None if stopped || self.abort.is_aborted() => {
                    if !stopped {
                        tracing::info!("Run interrupted before cell {}", cell.index);
                        stopped = true;
                    }
                    continue;
                }
                None => {
                    if !cell.is_skipped() {
                        callback.on_cell_started(cell);
                    }
                    self.dispatch(cell, mode, &mut env, workspace).await
                }
            };

            callback.on_cell_finished(cell, &result);
            results.push(CellRecord {
                index: cell.index,
                kind: cell.kind,
                result,
            });
        }

        (results, env)
    }

    async fn dispatch(
        &self,
        cell: &Cell,
        mode: RunMode,
        env: &mut VariableEnvironment,
        workspace: &IsolatedWorkspace,
    ) -> RunResult {
        if cell.is_skipped() {
            tracing::debug!("Cell {} is marked as skipped", cell.index);
            return self.stamp(RunResult::skipped(), Instant::now());
        }

        let started = Instant::now();
        let ctx = RunContext {
            env: &*env,
            mode,
            workspace,
            active: &self.active,
            abort: &self.abort,
        };

        let runner: &dyn CellRunner = match cell.kind {
            CellKind::Query => &self.query,
            CellKind::Config => &self.config_runner,
            CellKind::Script => &self.script,
        };

        let outcome = match runner.run(cell, &ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Cell {} failed: {}", cell.index, e);
                CellOutcome::unchanged(RunResult::error(e.to_string()))
            }
        };

        if let Some(updated) = outcome.env {
            *env = updated;
        }
        self.stamp(outcome.result, started)
    }

    fn stamp(&self, mut result: RunResult, started: Instant) -> RunResult {
        result.execution_order = self.execution_order.fetch_add(1, Ordering::SeqCst) + 1;
        result.elapsed = started.elapsed();
        result
    }
}
