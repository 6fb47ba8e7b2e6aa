//! Externally observable progress for task runs.
//!
//! Provides:
//! - `ProgressTracker`: durable, pollable status of one run
//! - `ProgressRecord`: the on-disk record
//! - `ActivitySet`: activity-weighted progress model

mod activity;
mod record;
mod tracker;

pub use activity::*;
pub use record::*;
pub use tracker::*;
