//! Task run types.
//!
//! A `TaskRequest` describes what the caller wants executed, a `TaskRun` is
//! the executor's view of one invocation, and a `TaskOutput` is what the
//! target operation hands back.

use crate::lifecycle::TaskState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Caller input for one executor invocation.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Unique within a scope; identifies the checkpoint
    pub task_name: String,
    /// Opaque input payload for the operation
    pub query: String,
    /// Label of the operation provider; selects the circuit-breaker bucket
    pub provider: String,
    /// Expected wall-clock duration of a fresh run
    pub estimated_duration: Duration,
}

impl TaskRequest {
    pub fn new(
        task_name: impl Into<String>,
        query: impl Into<String>,
        provider: impl Into<String>,
        estimated_duration: Duration,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            query: query.into(),
            provider: provider.into(),
            estimated_duration,
        }
    }
}

/// One invocation of the executor for a named task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_name: String,
    /// Effective query (rewritten into a resume brief when resuming)
    pub query: String,
    pub provider: String,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub estimated_duration: Duration,
    pub resumed: bool,
}

impl TaskRun {
    pub fn new(request: &TaskRequest) -> Self {
        Self {
            task_name: request.task_name.clone(),
            query: request.query.clone(),
            provider: request.provider.clone(),
            state: TaskState::Pending,
            started_at: Utc::now(),
            estimated_duration: request.estimated_duration,
            resumed: false,
        }
    }
}

/// Value returned by a target operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Opaque result payload
    pub result: serde_json::Value,
    /// Sources/evidence gathered while producing the result
    #[serde(default)]
    pub collected_items: Vec<serde_json::Value>,
}

impl TaskOutput {
    pub fn new(result: serde_json::Value, collected_items: Vec<serde_json::Value>) -> Self {
        Self {
            result,
            collected_items,
        }
    }

    /// Length of the result's textual rendering.
    pub fn content_length(&self) -> usize {
        match &self.result {
            serde_json::Value::String(s) => s.len(),
            serde_json::Value::Null => 0,
            other => other.to_string().len(),
        }
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_run_starts_pending() {
        let request = TaskRequest::new("market-overview", "q", "deep", Duration::from_secs(60));
        let run = TaskRun::new(&request);
        assert_eq!(run.state, TaskState::Pending);
        assert!(!run.resumed);

        let encoded = serde_json::to_value(&run).unwrap();
        assert_eq!(encoded["estimated_duration"], json!(60.0));
    }

    #[test]
    fn test_content_length() {
        assert_eq!(TaskOutput::new(json!("hello"), vec![]).content_length(), 5);
        assert_eq!(TaskOutput::default().content_length(), 0);
        assert_eq!(TaskOutput::new(json!({"a": 1}), vec![]).content_length(), 7);
    }
}
