//! Explicit state machine for a single task run.
//!
//! Invariants:
//! - Only transitions in `ALLOWED` are ever applied
//! - A rejected transition leaves the current state untouched
//! - Completed and Failed are terminal: nothing leaves them
//! - Every applied transition is kept in the history

use crate::models::{PerduraError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of recent transitions reported in an `InvalidTransition` error.
const RECENT_HISTORY: usize = 5;

/// State of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Created, not started
    Pending,
    /// Target operation in flight
    Running,
    /// A checkpoint was just recorded
    Checkpointed,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Checkpointed => "checkpointed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event that drives a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskEvent {
    Start,
    Checkpoint,
    Resume,
    Complete,
    Fail,
}

impl TaskEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Checkpoint => "checkpoint",
            Self::Resume => "resume",
            Self::Complete => "complete",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The complete set of legal `(from, event, to)` triples.
const ALLOWED: &[(TaskState, TaskEvent, TaskState)] = &[
    (TaskState::Pending, TaskEvent::Start, TaskState::Running),
    (TaskState::Running, TaskEvent::Checkpoint, TaskState::Checkpointed),
    (TaskState::Running, TaskEvent::Complete, TaskState::Completed),
    (TaskState::Running, TaskEvent::Fail, TaskState::Failed),
    (TaskState::Checkpointed, TaskEvent::Resume, TaskState::Running),
    (TaskState::Checkpointed, TaskEvent::Fail, TaskState::Failed),
];

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TaskState,
    pub to: TaskState,
    pub event: TaskEvent,
    pub at: DateTime<Utc>,
}

/// State machine for one task instance.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: TaskState,
    history: Vec<TransitionRecord>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a machine in `Pending`.
    pub fn new() -> Self {
        Self {
            state: TaskState::Pending,
            history: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Full transition history, oldest first.
    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Events accepted from the current state.
    pub fn valid_events(&self) -> Vec<TaskEvent> {
        valid_events_from(self.state)
    }

    /// Whether `(current, to, event)` is in the allow-list.
    pub fn can_transition(&self, to: TaskState, event: TaskEvent) -> bool {
        is_allowed(self.state, event, to)
    }

    /// Apply a transition, or fail without changing state.
    pub fn transition(&mut self, to: TaskState, event: TaskEvent) -> Result<()> {
        if !is_allowed(self.state, event, to) {
            let skip = self.history.len().saturating_sub(RECENT_HISTORY);
            return Err(PerduraError::InvalidTransition {
                from: self.state,
                to,
                event,
                valid_events: self.valid_events(),
                recent: self.history[skip..].to_vec(),
            });
        }

        self.history.push(TransitionRecord {
            from: self.state,
            to,
            event,
            at: Utc::now(),
        });
        self.state = to;
        Ok(())
    }

    /// Apply `event`, deriving the target state from the allow-list.
    pub fn fire(&mut self, event: TaskEvent) -> Result<TaskState> {
        let to = ALLOWED
            .iter()
            .find(|(from, ev, _)| *from == self.state && *ev == event)
            .map(|(_, _, to)| *to)
            // No legal target: report against the state the event usually leads to.
            .unwrap_or(match event {
                TaskEvent::Start | TaskEvent::Resume => TaskState::Running,
                TaskEvent::Checkpoint => TaskState::Checkpointed,
                TaskEvent::Complete => TaskState::Completed,
                TaskEvent::Fail => TaskState::Failed,
            });
        self.transition(to, event)?;
        Ok(to)
    }
}

fn is_allowed(from: TaskState, event: TaskEvent, to: TaskState) -> bool {
    ALLOWED
        .iter()
        .any(|&(f, e, t)| f == from && e == event && t == to)
}

fn valid_events_from(state: TaskState) -> Vec<TaskEvent> {
    ALLOWED
        .iter()
        .filter(|(from, _, _)| *from == state)
        .map(|(_, event, _)| *event)
        .collect()
}
