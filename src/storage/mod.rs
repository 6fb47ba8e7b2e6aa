//! Durable file plumbing shared by the checkpoint store and progress tracker.
//!
//! Provides:
//! - `write_json_atomic`: temp file + fsync + rename, so readers never see a torn file
//! - `read_json`: tolerant reader distinguishing missing from corrupt
//! - `TaskLocks`: one exclusive in-process lock per task name

mod atomic;
mod locks;

pub use atomic::*;
pub use locks::*;
