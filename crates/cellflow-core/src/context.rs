//! Run-scoped state shared between the controller and the runners:
//! cancellation, the active external handle, progress callbacks and the
//! per-cell execution context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::cell::Cell;
use crate::env::VariableEnvironment;
use crate::result::RunResult;
use crate::source::Driver;
use crate::workspace::IsolatedWorkspace;

/// How query cells are executed during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Run the statement and fetch its rows.
    #[default]
    Query,
    /// Fetch the plan only.
    Explain,
    /// Run under the plan analyzer inside an always-rolled-back transaction.
    ExplainAnalyze,
}

/// Flag checked between cells to stop a run early.
///
/// Clones share the flag, so any clone can stop the run.
///
/// ```
/// use cellflow_core::AbortHandle;
///
/// let handle = AbortHandle::new();
/// let clone = handle.clone();
/// clone.abort();
/// assert!(handle.is_aborted());
/// ```
#[derive(Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Clear the flag before a new run starts.
    pub fn reset(&self) {
        self.aborted.store(false, Ordering::SeqCst);
    }
}

/// Kill switch for a running script process.
///
/// The script runner waits on the process and on this handle at the same
/// time; `kill` wakes it up so it can terminate the child. A kill issued
/// before the runner starts waiting is remembered.
#[derive(Clone, Default)]
pub struct ProcessKillHandle {
    notify: Arc<Notify>,
    killed: Arc<AtomicBool>,
}

impl ProcessKillHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Resolves once [`kill`](Self::kill) has been called.
    pub async fn killed(&self) {
        if self.is_killed() {
            return;
        }
        self.notify.notified().await;
    }
}

/// The external operation a runner currently has in flight.
#[derive(Clone)]
pub enum ActiveHandle {
    /// A script interpreter process.
    Process(ProcessKillHandle),
    /// A remote session held by a data-source driver.
    Session(Arc<dyn Driver>),
}

impl ActiveHandle {
    /// Force-terminate the operation. Returns a diagnostic when a remote
    /// session could not be killed.
    pub async fn terminate(&self) -> Option<String> {
        match self {
            Self::Process(handle) => {
                handle.kill();
                None
            }
            Self::Session(driver) => driver.kill().await,
        }
    }
}

/// Slot holding at most one [`ActiveHandle`].
///
/// The lock is only held for the duration of a swap, never across an await.
#[derive(Clone, Default)]
pub struct ActiveSlot {
    inner: Arc<Mutex<Option<ActiveHandle>>>,
}

impl ActiveSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` and return a guard that clears the slot on drop.
    pub fn register(&self, handle: ActiveHandle) -> ActiveGuard<'_> {
        self.set(Some(handle));
        ActiveGuard { slot: self }
    }

    pub fn current(&self) -> Option<ActiveHandle> {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_none()
    }

    fn set(&self, value: Option<ActiveHandle>) {
        match self.inner.lock() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}

/// Clears its [`ActiveSlot`] when dropped, on every exit path.
pub struct ActiveGuard<'a> {
    slot: &'a ActiveSlot,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.slot.set(None);
    }
}

/// Host-side progress sink for a run.
pub trait ExecutionCallback: Send + Sync {
    /// Called before a cell's result is reported, in document order.
    ///
    /// Pre-execution cells run ahead of the others but report this event
    /// together with their result at their own position. Skipped cells only
    /// get [`on_cell_finished`](Self::on_cell_finished).
    fn on_cell_started(&self, cell: &Cell);

    /// Called with the recorded result of every processed cell.
    fn on_cell_finished(&self, cell: &Cell, result: &RunResult);

    /// Called once after the loop with the final environment.
    fn on_run_finished(&self, _variables: &VariableEnvironment, _interrupted: bool) {}
}

/// Callback that ignores every event.
pub struct NoopCallback;

impl ExecutionCallback for NoopCallback {
    fn on_cell_started(&self, _cell: &Cell) {}

    fn on_cell_finished(&self, _cell: &Cell, _result: &RunResult) {}
}

/// Everything a runner may use while executing one cell.
pub struct RunContext<'a> {
    /// Environment as left by the previous cell.
    pub env: &'a VariableEnvironment,
    pub mode: RunMode,
    pub workspace: &'a IsolatedWorkspace,
    /// Where to register in-flight external operations for interruption.
    pub active: &'a ActiveSlot,
    /// Run-wide interrupt flag.
    ///
    /// Check it after registering in [`active`](Self::active): an interrupt
    /// sets the flag before it reads the slot, so one of the two sides always
    /// sees the other.
    pub abort: &'a AbortHandle,
}

impl RunContext<'_> {
    pub fn is_interrupted(&self) -> bool {
        self.abort.is_aborted()
    }
}
