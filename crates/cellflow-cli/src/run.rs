//! Run command implementation for Cellflow CLI.
//!
//! Executes a notebook headlessly with a terminal progress callback. Ctrl-C
//! interrupts the run.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use cellflow_core::{
    Cell, ControllerConfig, DataSourceRegistry, ExecutionCallback, ExecutionController,
    NotebookContext, RunMode, RunResult, RunStatus, VariableEnvironment,
};

use crate::colors;
use crate::notebook;

/// Options for one `run` invocation.
pub struct RunOptions {
    pub notebook: PathBuf,
    pub mode: RunMode,
    pub from: Option<usize>,
    pub to: Option<usize>,
    pub interpreter: Option<PathBuf>,
    pub rules_dir: Option<PathBuf>,
    pub print_vars: bool,
}

/// Prints one line per cell plus its output.
#[derive(Default)]
pub struct ProgressCallback {
    /// Cell whose "Running" line is still open.
    pending: Mutex<Option<usize>>,
}

impl ProgressCallback {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_pending(&self) -> Option<usize> {
        match self.pending.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn set_pending(&self, index: usize) -> Option<usize> {
        match self.pending.lock() {
            Ok(mut guard) => guard.replace(index),
            Err(poisoned) => poisoned.into_inner().replace(index),
        }
    }
}

impl ExecutionCallback for ProgressCallback {
    fn on_cell_started(&self, cell: &Cell) {
        if self.set_pending(cell.index).is_some() {
            println!();
        }
        print!(
            "{}  ▶ Running{} {}[{}] {}{}... ",
            colors::CYAN,
            colors::RESET,
            colors::BOLD,
            cell.index,
            cell.kind,
            colors::RESET
        );
        colors::flush_stdout();
    }

    fn on_cell_finished(&self, cell: &Cell, result: &RunResult) {
        if self.take_pending() != Some(cell.index) {
            print!("    {}[{}] {}{} ", colors::BOLD, cell.index, cell.kind, colors::RESET);
        }
        match result.status {
            RunStatus::Executed if result.is_success() => println!(
                "{}✓{} {}({:.2}s){}",
                colors::GREEN,
                colors::RESET,
                colors::DIM,
                result.elapsed.as_secs_f64(),
                colors::RESET
            ),
            RunStatus::Skipped => println!("{}skipped{}", colors::DIM, colors::RESET),
            _ => println!("{}✗{}", colors::RED, colors::RESET),
        }

        print_result(result);
    }

    fn on_run_finished(&self, _variables: &VariableEnvironment, interrupted: bool) {
        if self.take_pending().is_some() {
            println!();
        }
        if interrupted {
            println!("{}Run interrupted{}", colors::YELLOW, colors::RESET);
        }
    }
}

fn print_result(result: &RunResult) {
    for line in result.stdout.lines() {
        println!("      {}", line);
    }
    if !result.stderr.is_empty() {
        for line in result.stderr.lines() {
            eprintln!("{}      {}{}", colors::RED, line, colors::RESET);
        }
    }
    for warning in &result.warnings {
        println!("{}      warning:{} {}", colors::YELLOW, colors::RESET, warning);
    }
    if let Some(rows) = result.metadata.as_ref().and_then(|m| m.rows()) {
        let annotated = rows.annotated_row_count();
        println!(
            "{}      {} row(s) in {}{}{}",
            colors::DIM,
            rows.row_count(),
            rows.meta.table_name.as_deref().unwrap_or("result"),
            if annotated > 0 {
                format!(", {} flagged by rules", annotated)
            } else {
                String::new()
            },
            colors::RESET
        );
    }
}

fn controller_config(options: &RunOptions, notebook_path: &Path) -> ControllerConfig {
    let rules_dir = options.rules_dir.clone().unwrap_or_else(|| {
        notebook_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    });
    ControllerConfig {
        interpreter: options.interpreter.clone(),
        rules_dir,
        ..ControllerConfig::default()
    }
}

/// Execute a notebook.
pub async fn execute(options: RunOptions) -> anyhow::Result<()> {
    let start = Instant::now();

    let cells = notebook::load(&options.notebook)?;
    let cells = notebook::select_range(cells, options.from, options.to);

    println!(
        "{}Running{} {} ({:?} mode)",
        colors::BOLD,
        colors::RESET,
        options.notebook.display(),
        options.mode
    );

    if cells.is_empty() {
        println!(
            "\n{}No code cells to run.{}",
            colors::YELLOW,
            colors::RESET
        );
        return Ok(());
    }

    let controller = Arc::new(ExecutionController::new(
        controller_config(&options, &options.notebook),
        Arc::new(DataSourceRegistry::new()),
    ));

    let interrupt = controller.interrupt_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}Interrupting...{}", colors::YELLOW, colors::RESET);
            interrupt.interrupt().await;
        }
    });

    let callback = ProgressCallback::new();
    let report = controller.start_run(&cells, options.mode, &callback).await;
    ctrl_c.abort();
    let report = report?;

    let context = NotebookContext::from_results(&report.results);
    if options.print_vars && context.visible_variables {
        println!("\n{}Variables:{}", colors::BOLD, colors::RESET);
        println!("{}", serde_json::to_string_pretty(&report.variables)?);
    }

    let failed = report.error_count();
    println!("\n{}", "─".repeat(50));
    println!(
        "{}Completed{} {} of {} cell(s) in {:.2}s",
        if failed == 0 { colors::GREEN } else { colors::YELLOW },
        colors::RESET,
        report.results.len(),
        cells.len(),
        start.elapsed().as_secs_f64()
    );

    if report.interrupted {
        anyhow::bail!("Run interrupted");
    }
    if failed > 0 {
        anyhow::bail!("{} cell(s) failed", failed);
    }
    Ok(())
}
