//! The contract between the executor and a target operation.

use crate::models::{self, TaskOutput};
use crate::progress::{ActivitySet, ProgressTracker};
use crate::retry::OperationError;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Which slot an operation fills; selects its circuit-breaker bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Primary,
    Fallback,
}

impl OperationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }

    /// Breaker key for this class of `provider`.
    pub fn breaker_key(self, provider: &str) -> String {
        format!("{provider}:{}", self.as_str())
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A slow external operation the executor can run, retry and resume.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn execute(&self, ctx: &OperationContext) -> Result<TaskOutput, OperationError>;
}

/// Adapter turning an async closure into an [`Operation`].
pub struct FnOperation<F>(F);

/// Wrap `f` as an [`Operation`]. The closure receives an owned context.
pub fn from_fn<F, Fut>(f: F) -> FnOperation<F>
where
    F: Fn(OperationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskOutput, OperationError>> + Send + 'static,
{
    FnOperation(f)
}

#[async_trait]
impl<F, Fut> Operation for FnOperation<F>
where
    F: Fn(OperationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskOutput, OperationError>> + Send + 'static,
{
    async fn execute(&self, ctx: &OperationContext) -> Result<TaskOutput, OperationError> {
        (self.0)(ctx.clone()).await
    }
}

/// Partial work published by a running operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialState {
    pub partial_result: Value,
    pub collected_items: Vec<Value>,
}

/// Handle an operation uses to publish partial work for checkpointing.
///
/// Only the latest state is kept; the checkpoint loop snapshots it on
/// each scheduled save.
#[derive(Debug, Clone)]
pub struct PartialReporter {
    tx: Arc<watch::Sender<PartialState>>,
}

impl PartialReporter {
    /// Create a reporter seeded with `initial`, plus the receiving side.
    pub fn channel(initial: PartialState) -> (Self, watch::Receiver<PartialState>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Replace the partial result.
    pub fn set_result(&self, partial_result: Value) {
        self.tx.send_modify(|s| s.partial_result = partial_result);
    }

    /// Append one collected item.
    pub fn push_item(&self, item: Value) {
        self.tx.send_modify(|s| s.collected_items.push(item));
    }

    /// Replace the whole partial state.
    pub fn report(&self, partial_result: Value, collected_items: Vec<Value>) {
        self.tx.send_replace(PartialState {
            partial_result,
            collected_items,
        });
    }

    /// Latest published state.
    pub fn current(&self) -> PartialState {
        self.tx.borrow().clone()
    }
}

/// Handle an operation uses to report activity-weighted progress.
///
/// Once activities are set, overall progress and phase in the progress
/// record follow the activity model; scheduled checkpoints only add history.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tracker: Arc<ProgressTracker>,
}

impl ProgressReporter {
    pub fn new(tracker: Arc<ProgressTracker>) -> Self {
        Self { tracker }
    }

    pub fn task_id(&self) -> &str {
        self.tracker.task_id()
    }

    /// Switch the run to activity-weighted progress.
    pub fn set_activities(&self, activities: ActivitySet) -> models::Result<()> {
        self.tracker.set_activities(activities)
    }

    /// Report progress within one activity; returns the new overall percentage.
    pub fn update_activity(&self, name: &str, progress_pct: f64) -> models::Result<f64> {
        self.tracker.update_activity(name, progress_pct)
    }

    /// Describe what the operation is doing right now.
    pub fn set_action(&self, action: &str) -> models::Result<()> {
        self.tracker.set_action(action)
    }
}

/// Everything an operation is told about the attempt it is serving.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub task_id: String,
    pub task_name: String,
    /// Input to work on: the original query, or a resume brief
    pub query: String,
    pub original_query: String,
    pub provider: String,
    pub class: OperationClass,
    /// 1-based attempt number within this class
    pub attempt: u32,
    pub resumed: bool,
    pub reporter: PartialReporter,
    pub progress: ProgressReporter,
}
