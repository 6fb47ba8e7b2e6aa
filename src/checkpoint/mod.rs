//! Checkpoint persistence for resumable tasks.
//!
//! Provides:
//! - `CheckpointStore`: save/load/list/delete/expire of per-task checkpoints
//! - `Checkpoint`: the durable snapshot of partial progress
//! - Resume helpers: resume brief, time-saved estimate, continuation check

mod resume;
mod store;

pub use resume::*;
pub use store::*;
