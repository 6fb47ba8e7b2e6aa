//! perdura - resumable execution of slow, failure-prone external operations.
//!
//! ## Architecture
//!
//! A `ResumableExecutor` runs one named task at a time:
//! - **Checkpoints**: a background loop snapshots partial work on a schedule;
//!   an interrupted run continues from the latest resumable checkpoint
//! - **Progress**: a durable record per run, pollable from another process
//! - **Retry**: failures are classified, retried with backoff and jitter,
//!   and gated by per operation-class circuit breakers
//!
//! ## Durability
//!
//! - Every on-disk write is temp file + fsync + rename
//! - Unreadable files are quarantined, never silently reused
//! - Success deletes the checkpoint; failure keeps it for the next call

pub mod checkpoint;
pub mod executor;
pub mod lifecycle;
pub mod models;
pub mod progress;
pub mod retry;
pub mod storage;

// Re-exports for convenience
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use executor::{
    from_fn, ExecutionResult, Operation, OperationContext, PartialReporter, ProgressReporter,
    ResumableExecutor,
};
pub use lifecycle::{StateMachine, TaskEvent, TaskState};
pub use models::{
    Config, PerduraError, Result, ScheduleEntry, TaskFailure, TaskOutput, TaskRequest,
};
pub use progress::{ActivitySet, ProgressRecord, ProgressTracker};
pub use retry::{BreakerRegistry, ErrorKind, OperationError, RetryController};
