//! Task lifecycle module.
//!
//! Provides:
//! - `TaskState` / `TaskEvent`: the states of one task run and the events that move it
//! - `StateMachine`: allow-list validated transitions with a full audit history

mod state_machine;

pub use state_machine::*;
