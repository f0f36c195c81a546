//! Workflow runtime: the superstep loop, the task runner, and the
//! execution infrastructure around them.
//!
//! - [`AppRunner`] drives supersteps against a thread's checkpoint lineage;
//! - [`TaskRunner`](task_runner::TaskRunner) executes one superstep's tasks
//!   concurrently with retry and cooperative cancellation;
//! - [`RunRegistry`] implements the external run lifecycle contract;
//! - [`RuntimeConfig`] carries per-invocation settings.

pub mod cancellation;
pub mod retry;
pub mod run;
pub mod runner;
pub mod runtime_config;
pub mod task_runner;

pub use cancellation::{AbortKind, AbortSignal, AbortSignals};
pub use retry::RetryPolicy;
pub use run::{CancelAction, MultitaskStrategy, Run, RunError, RunRegistry, RunStatus, ThreadStatus};
pub use runner::{AppRunner, GraphInput, GraphOutput, LoopError};
pub use runtime_config::{default_sqlite_url, RuntimeConfig};
pub use task_runner::{TaskOutcome, TaskResult, TaskRunner};
