//! External run lifecycle.
//!
//! The engine-facing contract for runs submitted against threads: status
//! transitions, thread status derivation, and the multitask strategies that
//! decide what happens when a new run hits a busy thread. This registry is
//! in-process bookkeeping; durable run queues live outside the core.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;
use uuid::Uuid;

/// Status of one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
    Interrupted,
    Timeout,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

/// Derived status of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    /// No pending or running runs, and no next tasks at the last checkpoint.
    Idle,
    /// A run exists.
    Busy,
    /// The last checkpoint has next tasks (suspended mid-graph).
    Interrupted,
    /// The last run ended in error.
    Error,
}

/// What to do when a run is submitted to a busy thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MultitaskStrategy {
    /// Refuse the new run.
    #[default]
    Reject,
    /// Cancel the current run and delete its record, then accept.
    Rollback,
    /// Interrupt the current run (state preserved), then accept.
    Interrupt,
    /// Queue the new run behind the current one.
    Enqueue,
}

/// How a cancellation treats the targeted run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelAction {
    /// Let running tasks observe the abort; record the run as interrupted,
    /// preserving the current checkpoint.
    Interrupt,
    /// Additionally delete the run record.
    Rollback,
}

/// One run record.
#[derive(Clone, Debug)]
pub struct Run {
    pub id: Uuid,
    pub thread_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Errors from run submission and transitions.
#[derive(Debug, Error, Diagnostic)]
pub enum RunError {
    #[error("thread `{thread_id}` is busy")]
    #[diagnostic(
        code(stepgraph::runs::busy),
        help("Use a multitask strategy other than reject, or wait for the active run.")
    )]
    ThreadBusy { thread_id: String },

    #[error("run {run_id} not found")]
    #[diagnostic(code(stepgraph::runs::not_found))]
    NotFound { run_id: Uuid },

    #[error("invalid transition from {from:?} to {to:?}")]
    #[diagnostic(code(stepgraph::runs::transition))]
    InvalidTransition { from: RunStatus, to: RunStatus },
}

/// In-process registry of runs per thread.
#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<FxHashMap<Uuid, Run>>,
}

impl RunRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a run against a thread, applying the multitask strategy when
    /// the thread is busy. Returns the accepted run id and, for the
    /// interrupt/rollback strategies, the run that was displaced.
    pub fn submit(
        &self,
        thread_id: &str,
        strategy: MultitaskStrategy,
    ) -> Result<(Uuid, Option<Uuid>), RunError> {
        let mut runs = self.runs.write();
        let active = runs
            .values()
            .find(|r| r.thread_id == thread_id && !r.status.is_terminal())
            .map(|r| r.id);

        let mut displaced = None;
        if let Some(active_id) = active {
            match strategy {
                MultitaskStrategy::Reject => {
                    return Err(RunError::ThreadBusy {
                        thread_id: thread_id.to_string(),
                    });
                }
                MultitaskStrategy::Rollback => {
                    runs.remove(&active_id);
                    displaced = Some(active_id);
                }
                MultitaskStrategy::Interrupt => {
                    if let Some(run) = runs.get_mut(&active_id) {
                        run.status = RunStatus::Interrupted;
                        run.updated_at = Utc::now();
                    }
                    displaced = Some(active_id);
                }
                MultitaskStrategy::Enqueue => {}
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        runs.insert(
            id,
            Run {
                id,
                thread_id: thread_id.to_string(),
                status: RunStatus::Pending,
                created_at: now,
                updated_at: now,
            },
        );
        Ok((id, displaced))
    }

    /// Move a run through its lifecycle. Only the transitions of the run
    /// state machine are allowed.
    pub fn transition(&self, run_id: Uuid, to: RunStatus) -> Result<(), RunError> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or(RunError::NotFound { run_id })?;
        let allowed = matches!(
            (run.status, to),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Interrupted)
                | (
                    RunStatus::Running,
                    RunStatus::Success
                        | RunStatus::Error
                        | RunStatus::Interrupted
                        | RunStatus::Timeout
                )
        );
        if !allowed {
            return Err(RunError::InvalidTransition {
                from: run.status,
                to,
            });
        }
        run.status = to;
        run.updated_at = Utc::now();
        Ok(())
    }

    /// Cancel a run. Idempotent: cancelling a terminal run is a no-op.
    pub fn cancel(&self, run_id: Uuid, action: CancelAction) -> Result<(), RunError> {
        let mut runs = self.runs.write();
        let Some(run) = runs.get_mut(&run_id) else {
            // Rollback already removed it; cancellation stays idempotent.
            return Ok(());
        };
        match action {
            CancelAction::Interrupt => {
                if !run.status.is_terminal() {
                    run.status = RunStatus::Interrupted;
                    run.updated_at = Utc::now();
                }
            }
            CancelAction::Rollback => {
                runs.remove(&run_id);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, run_id: Uuid) -> Option<Run> {
        self.runs.read().get(&run_id).cloned()
    }

    /// Derive a thread's status. `has_next` reports whether the thread's
    /// last checkpoint has pending next tasks.
    #[must_use]
    pub fn thread_status(&self, thread_id: &str, has_next: bool) -> ThreadStatus {
        let runs = self.runs.read();
        let mut last: Option<&Run> = None;
        for run in runs.values().filter(|r| r.thread_id == thread_id) {
            if !run.status.is_terminal() {
                return ThreadStatus::Busy;
            }
            if last.is_none_or(|l| run.updated_at > l.updated_at) {
                last = Some(run);
            }
        }
        if has_next {
            return ThreadStatus::Interrupted;
        }
        match last {
            Some(run) if run.status == RunStatus::Error => ThreadStatus::Error,
            _ => ThreadStatus::Idle,
        }
    }
}
