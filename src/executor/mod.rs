//! Resumable task execution.
//!
//! Provides:
//! - `Operation`: the contract a target operation implements
//! - `ResumableExecutor`: checkpointed, retried, resumable runs
//! - `plan_schedule`: checkpoint points still ahead of a (resumed) run

mod checkpoint_loop;
mod operation;
mod resumable;

pub use checkpoint_loop::{plan_schedule, LoopReport};
pub use operation::*;
pub use resumable::*;
