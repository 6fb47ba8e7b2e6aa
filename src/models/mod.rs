//! Core data models for perdura.
//!
//! - `Config`: immutable settings handed to every component
//! - `PerduraError`: crate-wide error taxonomy
//! - `TaskRequest` / `TaskRun` / `TaskOutput`: one executor invocation

mod config;
mod error;
mod task;

pub use config::*;
pub use error::*;
pub use task::*;

pub(crate) use task::duration_secs;
