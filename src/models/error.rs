//! Error types for perdura.
//!
//! Taxonomy:
//! - Expected failures: bad configuration, illegal state transitions, bad input
//! - Infrastructure failures: filesystem, serialization
//! - Operation failures: the target operation gave up after classification/retry
//! - Internal invariant violations (bugs)

use crate::lifecycle::{TaskEvent, TaskState, TransitionRecord};
use crate::retry::ErrorKind;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for perdura.
#[derive(Debug, Error)]
pub enum PerduraError {
    // ═══════════════════════════════════════════════════════════════════
    // EXPECTED - programming or data errors, never retried
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error(
        "Invalid transition: cannot apply '{event}' in state {from} (valid events: {}; recent: {})",
        format_events(.valid_events),
        format_history(.recent)
    )]
    InvalidTransition {
        from: TaskState,
        to: TaskState,
        event: TaskEvent,
        valid_events: Vec<TaskEvent>,
        recent: Vec<TransitionRecord>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE - filesystem and encoding
    // ═══════════════════════════════════════════════════════════════════
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // OPERATION - final outcome of the target operation
    // ═══════════════════════════════════════════════════════════════════
    #[error("{0}")]
    TaskFailed(Box<TaskFailure>),

    // ═══════════════════════════════════════════════════════════════════
    // INTERNAL - invariant broken
    // ═══════════════════════════════════════════════════════════════════
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PerduraError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a serialization error with context.
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Check if retrying the same call later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TaskFailed(f) => f.kind != ErrorKind::Fatal,
            Self::Io { .. } => true,
            _ => false,
        }
    }

    /// Get a retry delay hint, if applicable.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TaskFailed(f) => f.cooldown,
            _ => None,
        }
    }

    /// The terminal task failure, if this error is one.
    pub fn task_failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::TaskFailed(f) => Some(f),
            _ => None,
        }
    }
}

/// Terminal failure of an executor run, with recovery guidance.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task_name: String,
    pub task_id: String,
    /// Classification of the last error seen
    pub kind: ErrorKind,
    /// Whether the run was stopped by an open circuit breaker
    pub circuit_open: bool,
    pub message: String,
    /// Progress of the checkpoint left on disk, if any
    pub checkpoint_pct: Option<f64>,
    pub checkpoint_resumable: bool,
    /// Suggested wait before retrying the same call
    pub cooldown: Option<Duration>,
}

impl TaskFailure {
    /// Value recorded as `error_type` in progress records.
    pub fn error_type(&self) -> &'static str {
        if self.circuit_open {
            "circuit_open"
        } else {
            self.kind.as_str()
        }
    }

    /// Human readable next step for the caller.
    pub fn recovery_hint(&self) -> String {
        let wait = match self.cooldown {
            Some(d) => format!("retry after cooldown ({}s)", d.as_secs().max(1)),
            None => "retry later".to_string(),
        };

        if self.kind == ErrorKind::Fatal && !self.circuit_open {
            return match self.checkpoint_pct {
                Some(pct) => format!(
                    "fix the underlying problem before retrying; checkpoint at {pct:.0}% is kept"
                ),
                None => "fix the underlying problem before retrying".to_string(),
            };
        }

        match (self.checkpoint_pct, self.checkpoint_resumable) {
            (Some(pct), true) => format!("resumable checkpoint available at {pct:.0}%, {wait}"),
            (Some(pct), false) => {
                format!("checkpoint at {pct:.0}% is too late to resume, task will restart; {wait}")
            }
            (None, _) => format!("no checkpoint saved, task will restart; {wait}"),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task '{}' failed ({}): {} [{}]",
            self.task_name,
            self.error_type(),
            self.message,
            self.recovery_hint()
        )
    }
}

fn format_events(events: &[TaskEvent]) -> String {
    if events.is_empty() {
        return "none".to_string();
    }
    events
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_history(history: &[TransitionRecord]) -> String {
    if history.is_empty() {
        return "none".to_string();
    }
    history
        .iter()
        .map(|r| format!("{}-({})->{}", r.from, r.event, r.to))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for perdura.
pub type Result<T> = std::result::Result<T, PerduraError>;
