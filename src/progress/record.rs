//! Externally pollable progress record.

use super::Activity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Externally visible status of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// Progress snapshot recorded when a checkpoint is taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub at: DateTime<Utc>,
    pub phase: String,
    pub progress_pct: f64,
    pub action: String,
}

/// Live status of one task run, rewritten atomically on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub task_id: String,
    pub task_name: String,
    pub scope_id: String,
    pub query: String,
    pub provider: String,
    pub status: ProgressStatus,
    pub resumed: bool,
    pub estimated_duration_sec: f64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub estimated_completion_at: DateTime<Utc>,
    pub phase: String,
    pub progress_pct: f64,
    pub current_action: String,
    #[serde(rename = "checkpoints", default)]
    pub checkpoint_history: Vec<CheckpointSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_status: Option<Vec<Activity>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl ProgressRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock time since the run started.
    pub fn elapsed(&self) -> Duration {
        (self.updated_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Estimated time left, as of the last update.
    pub fn remaining(&self) -> Duration {
        (self.estimated_completion_at - self.updated_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Recompute `estimated_completion_at` from elapsed time and progress.
    ///
    /// With no progress yet, the caller's estimate is used as-is.
    pub(crate) fn refresh_estimate(&mut self) {
        let fraction = self.progress_pct / 100.0;
        let total_secs = if fraction > 0.0 {
            let elapsed = (self.updated_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
            elapsed / fraction
        } else {
            self.estimated_duration_sec
        };
        // Keep absurd extrapolations representable.
        let millis = (total_secs * 1000.0).clamp(0.0, 365.0 * 24.0 * 3600.0 * 1000.0);
        self.estimated_completion_at =
            self.started_at + chrono::Duration::milliseconds(millis as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ProgressRecord {
        let started = Utc::now();
        ProgressRecord {
            task_id: "deep-market-overview-1".to_string(),
            task_name: "market-overview".to_string(),
            scope_id: "phase-1".to_string(),
            query: "q".to_string(),
            provider: "deep".to_string(),
            status: ProgressStatus::Running,
            resumed: false,
            estimated_duration_sec: 60.0,
            started_at: started,
            updated_at: started,
            estimated_completion_at: started,
            phase: "starting".to_string(),
            progress_pct: 0.0,
            current_action: String::new(),
            checkpoint_history: Vec::new(),
            activity_status: None,
            result: None,
            error: None,
            error_type: None,
        }
    }

    #[test]
    fn test_estimate_uses_caller_duration_before_progress() {
        let mut r = record();
        r.refresh_estimate();
        assert_eq!(r.estimated_completion_at - r.started_at, chrono::Duration::seconds(60));
    }

    #[test]
    fn test_estimate_extrapolates_from_progress() {
        let mut r = record();
        r.updated_at = r.started_at + chrono::Duration::seconds(30);
        r.progress_pct = 25.0;
        r.refresh_estimate();
        assert_eq!(r.estimated_completion_at - r.started_at, chrono::Duration::seconds(120));
        assert_eq!(r.remaining(), Duration::from_secs(90));
    }

    #[test]
    fn test_serialized_field_names() {
        let value = serde_json::to_value(record()).unwrap();
        assert_eq!(value["status"], "running");
        assert!(value.get("checkpoints").is_some());
        assert!(value.get("result").is_none());
    }
}
