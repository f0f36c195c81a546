//! Superstep primitives.
//!
//! The pure functions at the heart of the engine: selecting the next task
//! set, committing writes deterministically, gating static interrupts, and
//! reading state with a task's own writes overlaid. The loop drives these;
//! nothing here does I/O.

pub mod apply;
pub mod interrupt;
pub mod prepare;
pub mod read;

pub use apply::{apply_writes, CommitOutcome, CommittedTask};
pub use interrupt::{mark_interrupt_seen, should_interrupt, InterruptNodes};
pub use prepare::{
    index_pending_writes, prepare_next_tasks, task_id, PendingWriteIndex, PrepareContext, Task,
    TaskPath,
};
pub use read::local_read;
