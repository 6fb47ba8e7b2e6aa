//! Background checkpoint writer for one task run.
//!
//! Runs next to the target operation and stops only when cancelled. On each
//! due schedule point it snapshots the operation's latest partial state into
//! the checkpoint store and records the checkpoint in the progress tracker;
//! between points it refreshes the progress record as a heartbeat.

use super::PartialState;
use crate::checkpoint::{CheckpointMetadata, CheckpointStore, NewCheckpoint};
use crate::models::ScheduleEntry;
use crate::progress::ProgressTracker;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Summary of what the loop wrote before it was stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoopReport {
    pub checkpoints_saved: u32,
    pub last_progress_pct: Option<f64>,
}

/// Schedule points still ahead of a run.
///
/// A resumed run skips points at or below the checkpoint it resumed from
/// and reaches the remaining ones `invested` earlier.
pub fn plan_schedule(
    schedule: &[ScheduleEntry],
    resumed_from: Option<(f64, Duration)>,
) -> Vec<ScheduleEntry> {
    let mut plan: Vec<ScheduleEntry> = match resumed_from {
        None => schedule.to_vec(),
        Some((pct, invested)) => schedule
            .iter()
            .filter(|e| e.progress_pct > pct)
            .map(|e| ScheduleEntry {
                elapsed_sec: e.elapsed_sec.saturating_sub(invested.as_secs()),
                ..e.clone()
            })
            .collect(),
    };
    plan.sort_by_key(|e| e.elapsed_sec);
    plan
}

pub(crate) struct CheckpointLoop {
    pub store: Arc<CheckpointStore>,
    pub tracker: Arc<ProgressTracker>,
    pub partial: watch::Receiver<PartialState>,
    pub task_name: String,
    /// Original query, never the resume brief
    pub query: String,
    pub plan: Vec<ScheduleEntry>,
    pub check_interval: Duration,
}

impl CheckpointLoop {
    pub async fn run(self, cancel: CancellationToken) -> LoopReport {
        let start = Instant::now();
        let mut report = LoopReport::default();
        let mut pending = self.plan.iter().peekable();

        loop {
            let heartbeat_at = Instant::now().checked_add(self.check_interval);
            let due_at = pending
                .peek()
                .and_then(|e| start.checked_add(Duration::from_secs(e.elapsed_sec)));
            let wake = match (due_at, heartbeat_at) {
                (Some(a), Some(b)) => a.min(b),
                (Some(at), None) | (None, Some(at)) => at,
                (None, None) => {
                    cancel.cancelled().await;
                    break;
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(wake) => {}
            }

            let elapsed = start.elapsed();
            let mut saved = false;
            while let Some(entry) =
                pending.next_if(|e| Duration::from_secs(e.elapsed_sec) <= elapsed)
            {
                if self.save(entry, elapsed) {
                    report.checkpoints_saved += 1;
                    report.last_progress_pct = Some(entry.progress_pct);
                    saved = true;
                }
            }

            if !saved {
                if let Err(e) = self.tracker.heartbeat() {
                    warn!(task_name = %self.task_name, error = %e, "Progress heartbeat failed");
                }
            }
        }

        debug!(
            task_name = %self.task_name,
            checkpoints = report.checkpoints_saved,
            "Checkpoint loop stopped"
        );
        report
    }

    fn save(&self, entry: &ScheduleEntry, elapsed: Duration) -> bool {
        let partial = self.partial.borrow().clone();
        let content_length = match &partial.partial_result {
            Value::String(s) => s.len(),
            Value::Null => 0,
            other => other.to_string().len(),
        };

        let mut extra = BTreeMap::new();
        extra.insert("phase".to_string(), json!(entry.phase_name));
        extra.insert("elapsed_sec".to_string(), json!(elapsed.as_secs()));
        extra.insert("task_id".to_string(), json!(self.tracker.task_id()));

        let checkpoint = NewCheckpoint {
            task_name: self.task_name.clone(),
            query: self.query.clone(),
            progress_pct: entry.progress_pct,
            resumable: entry.resumable,
            metadata: CheckpointMetadata {
                source_count: partial.collected_items.len(),
                content_length,
                reason: "scheduled".to_string(),
                extra,
            },
            partial_result: partial.partial_result,
            collected_items: partial.collected_items,
        };

        if let Err(e) = self.store.save(checkpoint) {
            warn!(task_name = %self.task_name, error = %e, "Failed to save checkpoint");
            return false;
        }

        info!(
            task_name = %self.task_name,
            progress_pct = entry.progress_pct,
            phase = %entry.phase_name,
            resumable = entry.resumable,
            "Checkpoint saved"
        );

        let action = format!("Checkpoint saved at {:.0}%", entry.progress_pct);
        if let Err(e) = self
            .tracker
            .update(&entry.phase_name, &action, entry.progress_pct, true)
        {
            warn!(task_name = %self.task_name, error = %e, "Failed to record checkpoint progress");
        }
        true
    }
}
