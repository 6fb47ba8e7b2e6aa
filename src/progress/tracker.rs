//! Progress tracker for one task run.
//!
//! Invariants:
//! - The record on disk is replaced atomically on every change
//! - `updated_at` never moves backwards
//! - `progress_pct` stays within [0, 100]
//! - Once completed or failed, the record is frozen
//!
//! Records live at `<progress_dir>/<scope>/<task_id>.json` and can be polled
//! by an unrelated process with [`ProgressTracker::read`].

use super::{ActivitySet, CheckpointSnapshot, ProgressRecord, ProgressStatus};
use crate::lifecycle::{StateMachine, TaskEvent, TaskState};
use crate::models::{PerduraError, Result, TaskRun};
use crate::storage::{read_json, remove_if_exists, sanitize_file_stem, write_json_atomic, JsonRead};
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct TrackerState {
    record: ProgressRecord,
    machine: StateMachine,
    activities: Option<ActivitySet>,
}

/// Durable, pollable status of one task run.
#[derive(Debug)]
pub struct ProgressTracker {
    task_id: String,
    path: PathBuf,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    /// Create the progress record for `run` and move it to Running.
    pub fn start(root: &Path, scope_id: &str, run: &TaskRun) -> Result<Self> {
        let dir = root.join(sanitize_file_stem(scope_id));
        fs::create_dir_all(&dir).map_err(|e| PerduraError::io("creating progress dir", e))?;

        let now = Utc::now();
        let task_id = sanitize_file_stem(&format!(
            "{}-{}-{}",
            run.provider,
            run.task_name,
            now.format("%Y%m%d%H%M%S%3f")
        ));
        let path = dir.join(format!("{task_id}.json"));

        let mut machine = StateMachine::new();
        machine.fire(TaskEvent::Start)?;

        let mut record = ProgressRecord {
            task_id: task_id.clone(),
            task_name: run.task_name.clone(),
            scope_id: scope_id.to_string(),
            query: run.query.clone(),
            provider: run.provider.clone(),
            status: ProgressStatus::Running,
            resumed: run.resumed,
            estimated_duration_sec: run.estimated_duration.as_secs_f64(),
            started_at: now,
            updated_at: now,
            estimated_completion_at: now,
            phase: if run.resumed { "resuming" } else { "starting" }.to_string(),
            progress_pct: 0.0,
            current_action: "Task started".to_string(),
            checkpoint_history: Vec::new(),
            activity_status: None,
            result: None,
            error: None,
            error_type: None,
        };
        record.refresh_estimate();
        write_json_atomic(&path, &record)?;

        info!(
            task_id = %task_id,
            task_name = %run.task_name,
            resumed = run.resumed,
            "Progress tracking started"
        );

        Ok(Self {
            task_id,
            path,
            state: Mutex::new(TrackerState {
                record,
                machine,
                activities: None,
            }),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current lifecycle state of the run.
    pub fn state(&self) -> Result<TaskState> {
        Ok(self.lock()?.machine.state())
    }

    /// Switch to activity-weighted progress.
    pub fn set_activities(&self, activities: ActivitySet) -> Result<()> {
        let mut state = self.lock()?;
        ensure_open(&state)?;
        state.record.activity_status = Some(activities.activities().to_vec());
        state.record.progress_pct = activities.overall_pct();
        state.activities = Some(activities);
        self.persist(&mut state)
    }

    /// Set phase, action and overall progress directly.
    ///
    /// With `checkpoint`, the update is also appended to the checkpoint
    /// history and the run passes through Checkpointed. Once an activity set
    /// is configured, phase and overall progress belong to it and only the
    /// action is taken from here.
    pub fn update(&self, phase: &str, action: &str, progress_pct: f64, checkpoint: bool) -> Result<()> {
        if !(0.0..=100.0).contains(&progress_pct) {
            return Err(PerduraError::InvalidInput(format!(
                "progress must be within [0, 100], got {progress_pct}"
            )));
        }

        let mut state = self.lock()?;
        ensure_open(&state)?;

        if checkpoint {
            state.machine.fire(TaskEvent::Checkpoint)?;
            state.machine.fire(TaskEvent::Resume)?;
            state.record.checkpoint_history.push(CheckpointSnapshot {
                at: Utc::now(),
                phase: phase.to_string(),
                progress_pct,
                action: action.to_string(),
            });
        }

        state.record.current_action = action.to_string();
        if state.activities.is_none() {
            state.record.phase = phase.to_string();
            state.record.progress_pct = progress_pct;
        }
        self.persist(&mut state)
    }

    /// Set progress within one activity; overall progress, phase and action
    /// are derived from the activity set.
    pub fn update_activity(&self, name: &str, progress_pct: f64) -> Result<f64> {
        let mut state = self.lock()?;
        ensure_open(&state)?;

        let activities = state.activities.as_mut().ok_or_else(|| {
            PerduraError::InvalidInput("no activity set configured for this tracker".to_string())
        })?;
        activities.update(name, progress_pct)?;

        let overall = activities.overall_pct();
        let (phase, action) = match activities.current() {
            Some(a) if a.started => (a.name.clone(), format!("{}: {:.0}%", a.name, a.progress_pct)),
            Some(a) => (a.name.clone(), format!("{}: pending", a.name)),
            None => ("finishing".to_string(), "All activities complete".to_string()),
        };
        let snapshot = activities.activities().to_vec();

        state.record.phase = phase;
        state.record.current_action = action;
        state.record.progress_pct = overall;
        state.record.activity_status = Some(snapshot);
        self.persist(&mut state)?;
        Ok(overall)
    }

    /// Change only the current action.
    pub fn set_action(&self, action: &str) -> Result<()> {
        let mut state = self.lock()?;
        ensure_open(&state)?;
        state.record.current_action = action.to_string();
        self.persist(&mut state)
    }

    /// Refresh `updated_at` and the completion estimate without other changes.
    pub fn heartbeat(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.machine.is_terminal() {
            return Ok(());
        }
        self.persist(&mut state)
    }

    /// Mark the run completed and freeze the record.
    pub fn complete(&self, result: Value) -> Result<()> {
        let mut state = self.lock()?;
        state.machine.fire(TaskEvent::Complete)?;

        state.record.status = ProgressStatus::Completed;
        state.record.phase = "completed".to_string();
        state.record.current_action = "Task completed".to_string();
        state.record.progress_pct = 100.0;
        state.record.result = Some(result);
        self.persist(&mut state)?;

        info!(task_id = %self.task_id, "Task completed");
        Ok(())
    }

    /// Mark the run failed and freeze the record.
    pub fn fail(&self, error: &str, error_type: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.machine.fire(TaskEvent::Fail)?;

        state.record.status = ProgressStatus::Failed;
        state.record.phase = "failed".to_string();
        state.record.current_action = "Task failed".to_string();
        state.record.error = Some(error.to_string());
        state.record.error_type = Some(error_type.to_string());
        self.persist(&mut state)?;

        warn!(task_id = %self.task_id, error_type, error, "Task failed");
        Ok(())
    }

    /// In-memory copy of the record.
    pub fn snapshot(&self) -> Result<ProgressRecord> {
        Ok(self.lock()?.record.clone())
    }

    /// Poll a record from disk. Absent or unreadable records read as `None`.
    pub fn read(root: &Path, scope_id: &str, task_id: &str) -> Result<Option<ProgressRecord>> {
        let path = root
            .join(sanitize_file_stem(scope_id))
            .join(format!("{}.json", sanitize_file_stem(task_id)));
        Ok(Self::read_path(&path))
    }

    /// Like [`read`](Self::read), but rides out a record that is briefly
    /// absent or unreadable by polling up to `attempts` times.
    pub async fn read_patiently(
        root: &Path,
        scope_id: &str,
        task_id: &str,
        attempts: u32,
        interval: Duration,
    ) -> Result<Option<ProgressRecord>> {
        for attempt in 1..=attempts.max(1) {
            if let Some(record) = Self::read(root, scope_id, task_id)? {
                return Ok(Some(record));
            }
            if attempt < attempts {
                debug!(task_id, attempt, "Progress record not readable yet");
                tokio::time::sleep(interval).await;
            }
        }
        Ok(None)
    }

    pub fn read_path(path: &Path) -> Option<ProgressRecord> {
        match read_json(path) {
            JsonRead::Found(record) => Some(record),
            JsonRead::Missing => None,
            JsonRead::Corrupt(reason) => {
                debug!(path = %path.display(), reason = %reason, "Unreadable progress record");
                None
            }
        }
    }

    /// Every record in a scope, oldest start first.
    pub fn list(root: &Path, scope_id: &str) -> Result<Vec<ProgressRecord>> {
        let dir = root.join(sanitize_file_stem(scope_id));
        let pattern = format!("{}/*.json", glob::Pattern::escape(&dir.to_string_lossy()));
        let mut records: Vec<ProgressRecord> = glob::glob(&pattern)
            .map_err(|e| PerduraError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .filter_map(|p| Self::read_path(&p))
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(records)
    }

    /// Records still running in a scope.
    pub fn list_active(root: &Path, scope_id: &str) -> Result<Vec<ProgressRecord>> {
        Ok(Self::list(root, scope_id)?
            .into_iter()
            .filter(|r| r.status == ProgressStatus::Running)
            .collect())
    }

    /// Delete terminal records last updated longer than `retention` ago.
    pub fn cleanup_finished(root: &Path, scope_id: &str, retention: Duration) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for record in Self::list(root, scope_id)? {
            let age = (now - record.updated_at).to_std().unwrap_or(Duration::ZERO);
            if !record.is_terminal() || age <= retention {
                continue;
            }
            let path = root
                .join(sanitize_file_stem(scope_id))
                .join(format!("{}.json", sanitize_file_stem(&record.task_id)));
            if remove_if_exists(&path)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(scope = scope_id, removed, "Removed finished progress records");
        }
        Ok(removed)
    }

    fn lock(&self) -> Result<MutexGuard<'_, TrackerState>> {
        self.state
            .lock()
            .map_err(|_| PerduraError::Internal(format!("progress state poisoned for '{}'", self.task_id)))
    }

    fn persist(&self, state: &mut TrackerState) -> Result<()> {
        let now = Utc::now();
        state.record.updated_at = now.max(state.record.updated_at);
        state.record.refresh_estimate();
        write_json_atomic(&self.path, &state.record)?;
        debug!(
            task_id = %self.task_id,
            progress_pct = state.record.progress_pct,
            phase = %state.record.phase,
            "Progress written"
        );
        Ok(())
    }
}

fn ensure_open(state: &TrackerState) -> Result<()> {
    if state.machine.is_terminal() {
        return Err(PerduraError::InvalidInput(format!(
            "progress record '{}' is {} and can no longer change",
            state.record.task_id, state.record.status
        )));
    }
    Ok(())
}
