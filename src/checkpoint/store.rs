//! Durable checkpoint store.
//!
//! Invariants:
//! - One checkpoint file per task name; saving supersedes the previous one
//! - Files are replaced atomically (write-then-rename) under a per-task lock
//! - A corrupt or unreadable file is reported as absent, never as a crash;
//!   it is moved aside so the reason can be inspected later
//! - Backups are timestamped and never overwritten

use super::resume::{self, ContinuationCheck, TimeSavings};
use crate::models::{Config, PerduraError, Result, ScheduleEntry, TaskOutput};
use crate::storage::{
    read_json, remove_if_exists, sanitize_file_stem, write_json_atomic, write_json_new, JsonRead,
    TaskLocks,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Format version written into every checkpoint file.
pub const CHECKPOINT_VERSION: u32 = 1;

const BACKUP_DIR: &str = "backups";
const CORRUPT_MARKER: &str = ".corrupt-";

/// Free-form checkpoint metadata with a few well-known keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Number of collected items at save time
    #[serde(default)]
    pub source_count: usize,
    /// Size of the partial result at save time
    #[serde(default)]
    pub content_length: usize,
    /// Why this checkpoint was taken
    #[serde(default)]
    pub reason: String,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Durable snapshot of partial progress for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub task_name: String,
    pub scope_id: String,
    pub query: String,
    pub created_at: DateTime<Utc>,
    pub progress_pct: f64,
    pub resumable: bool,
    #[serde(default)]
    pub partial_result: Value,
    #[serde(default)]
    pub collected_items: Vec<Value>,
    #[serde(default)]
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Time since the checkpoint was written.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Resumable and younger than `max_age`.
    pub fn can_resume(&self, max_age: Duration) -> bool {
        self.resumable && self.age() <= max_age
    }
}

/// Everything needed to write a checkpoint.
#[derive(Debug, Clone, Default)]
pub struct NewCheckpoint {
    pub task_name: String,
    pub query: String,
    pub partial_result: Value,
    pub collected_items: Vec<Value>,
    pub progress_pct: f64,
    pub resumable: bool,
    pub metadata: CheckpointMetadata,
}

/// Result of looking up a checkpoint.
#[derive(Debug, Clone)]
pub enum CheckpointLookup {
    Found(Checkpoint),
    Missing,
    /// The file existed but could not be used; it has been moved aside
    Corrupt { reason: String },
}

/// Files removed by an expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpireReport {
    pub checkpoints: usize,
    pub backups: usize,
    pub quarantined: usize,
}

impl ExpireReport {
    pub fn total(&self) -> usize {
        self.checkpoints + self.backups + self.quarantined
    }
}

/// Checkpoint persistence for one scope (e.g. one phase of a plan).
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    backup_dir: PathBuf,
    scope_id: String,
    keep_backups: bool,
    schedule: Vec<ScheduleEntry>,
    locks: TaskLocks,
}

impl CheckpointStore {
    /// Open the store for `scope_id` under the configured checkpoint root.
    pub fn new(config: &Config, scope_id: &str) -> Result<Self> {
        Self::open(&config.checkpoint_dir, scope_id, config)
    }

    /// Open the store for `scope_id` under an explicit root directory.
    pub fn open(root: &Path, scope_id: &str, config: &Config) -> Result<Self> {
        let dir = root.join(sanitize_file_stem(scope_id));
        let backup_dir = dir.join(BACKUP_DIR);
        fs::create_dir_all(&backup_dir)
            .map_err(|e| PerduraError::io("creating checkpoint dir", e))?;

        Ok(Self {
            dir,
            backup_dir,
            scope_id: scope_id.to_string(),
            keep_backups: config.keep_backups,
            schedule: config.checkpoint_schedule.clone(),
            locks: TaskLocks::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    /// Path of the live checkpoint for a task.
    pub fn path_for(&self, task_name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", sanitize_file_stem(task_name)))
    }

    /// Write a checkpoint, superseding any previous one for the task.
    pub fn save(&self, new: NewCheckpoint) -> Result<Checkpoint> {
        if new.task_name.trim().is_empty() {
            return Err(PerduraError::InvalidInput(
                "checkpoint task name must not be empty".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&new.progress_pct) {
            return Err(PerduraError::InvalidInput(format!(
                "checkpoint progress must be within [0, 100], got {}",
                new.progress_pct
            )));
        }

        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            task_name: new.task_name,
            scope_id: self.scope_id.clone(),
            query: new.query,
            created_at: Utc::now(),
            progress_pct: new.progress_pct,
            resumable: new.resumable,
            partial_result: new.partial_result,
            collected_items: new.collected_items,
            metadata: new.metadata,
        };

        let path = self.path_for(&checkpoint.task_name);
        self.locks.with_lock(&checkpoint.task_name, || {
            write_json_atomic(&path, &checkpoint)?;
            if self.keep_backups {
                self.write_backup(&checkpoint);
            }
            Ok(())
        })?;

        debug!(
            task_name = %checkpoint.task_name,
            progress_pct = checkpoint.progress_pct,
            resumable = checkpoint.resumable,
            items = checkpoint.collected_items.len(),
            "Checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// Load the checkpoint for a task; corrupt files count as absent.
    pub fn load(&self, task_name: &str) -> Result<Option<Checkpoint>> {
        Ok(match self.inspect(task_name)? {
            CheckpointLookup::Found(cp) => Some(cp),
            CheckpointLookup::Missing | CheckpointLookup::Corrupt { .. } => None,
        })
    }

    /// Look up a checkpoint, reporting why it is unusable when it is.
    pub fn inspect(&self, task_name: &str) -> Result<CheckpointLookup> {
        let path = self.path_for(task_name);
        self.locks.with_lock(task_name, || {
            let reason = match read_json::<Checkpoint>(&path) {
                JsonRead::Missing => return Ok(CheckpointLookup::Missing),
                JsonRead::Found(cp) if cp.version > CHECKPOINT_VERSION => format!(
                    "unsupported checkpoint version {} (newest known is {CHECKPOINT_VERSION})",
                    cp.version
                ),
                JsonRead::Found(cp) if cp.task_name != task_name => {
                    // Another task whose name sanitizes to the same file.
                    warn!(
                        requested = task_name,
                        stored = %cp.task_name,
                        "Checkpoint file belongs to a different task"
                    );
                    return Ok(CheckpointLookup::Missing);
                }
                JsonRead::Found(cp) => return Ok(CheckpointLookup::Found(cp)),
                JsonRead::Corrupt(reason) => reason,
            };

            warn!(
                task_name,
                path = %path.display(),
                reason = %reason,
                "Ignoring unusable checkpoint"
            );
            self.quarantine(&path);
            Ok(CheckpointLookup::Corrupt { reason })
        })
    }

    /// Enumerate checkpoints in this scope, newest first.
    pub fn list(&self, resumable_only: bool) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoint_files()?
            .into_iter()
            .filter_map(|path| match read_json::<Checkpoint>(&path) {
                JsonRead::Found(cp) => Some(cp),
                JsonRead::Missing => None,
                JsonRead::Corrupt(reason) => {
                    warn!(path = %path.display(), reason = %reason, "Skipping unreadable checkpoint");
                    None
                }
            })
            .filter(|cp| !resumable_only || cp.resumable)
            .collect();

        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(checkpoints)
    }

    /// Remove the live checkpoint for a task. Backups are kept.
    pub fn delete(&self, task_name: &str) -> Result<bool> {
        let path = self.path_for(task_name);
        let removed = self
            .locks
            .with_lock(task_name, || remove_if_exists(&path))?;
        self.locks.release(task_name);
        if removed {
            debug!(task_name, "Checkpoint deleted");
        }
        Ok(removed)
    }

    /// Purge checkpoints, backups and quarantined files older than `max_age`.
    pub fn expire(&self, max_age: Duration) -> Result<ExpireReport> {
        let mut report = ExpireReport::default();
        let now = Utc::now();

        for path in self.checkpoint_files()? {
            let created_at = match read_json::<Checkpoint>(&path) {
                JsonRead::Found(cp) => Some(cp.created_at),
                _ => None,
            };
            let age = match created_at {
                Some(t) => (now - t).to_std().unwrap_or(Duration::ZERO),
                None => file_age(&path),
            };
            if age > max_age && remove_if_exists(&path)? {
                report.checkpoints += 1;
            }
        }

        for path in list_matching(&self.backup_dir, "*.json")? {
            if file_age(&path) > max_age && remove_if_exists(&path)? {
                report.backups += 1;
            }
        }

        for path in list_matching(&self.dir, &format!("*{CORRUPT_MARKER}*"))? {
            if file_age(&path) > max_age && remove_if_exists(&path)? {
                report.quarantined += 1;
            }
        }

        if report.total() > 0 {
            info!(
                scope = %self.scope_id,
                checkpoints = report.checkpoints,
                backups = report.backups,
                quarantined = report.quarantined,
                "Expired old checkpoints"
            );
        }
        Ok(report)
    }

    /// Resume brief for a task, if a resumable checkpoint exists.
    pub fn build_resume_context(&self, task_name: &str) -> Result<Option<String>> {
        Ok(self
            .load(task_name)?
            .filter(|cp| cp.resumable)
            .map(|cp| resume::render_resume_context(&cp)))
    }

    /// Coarse (invested, remaining) estimate for a checkpoint.
    pub fn estimate_savings(&self, checkpoint: &Checkpoint) -> TimeSavings {
        resume::estimate_savings(&self.schedule, checkpoint.progress_pct)
    }

    /// Compare a finished run against the task's stored checkpoint.
    pub fn verify_continuation(
        &self,
        task_name: &str,
        new_result: &TaskOutput,
    ) -> Result<Option<ContinuationCheck>> {
        Ok(self
            .load(task_name)?
            .map(|cp| resume::check_continuation(&cp, &new_result.collected_items)))
    }

    /// Backup files for a task, oldest first.
    pub fn backups_for(&self, task_name: &str) -> Result<Vec<PathBuf>> {
        let pattern = format!("{}_*.json", glob::Pattern::escape(&sanitize_file_stem(task_name)));
        let mut backups = list_matching(&self.backup_dir, &pattern)?;
        backups.sort();
        Ok(backups)
    }

    fn write_backup(&self, checkpoint: &Checkpoint) {
        let stem = sanitize_file_stem(&checkpoint.task_name);
        let stamp = checkpoint.created_at.format("%Y%m%dT%H%M%S%.6fZ");
        let path = self.backup_dir.join(format!("{stem}_{stamp}.json"));

        if let Err(e) = write_json_new(&path, checkpoint) {
            // The live checkpoint is already durable; a missing backup only
            // costs forensics.
            warn!(task_name = %checkpoint.task_name, error = %e, "Failed to write checkpoint backup");
        }
    }

    fn quarantine(&self, path: &Path) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = path.with_file_name(format!(
            "{name}{CORRUPT_MARKER}{}",
            Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
        ));
        if let Err(e) = fs::rename(path, &target) {
            warn!(path = %path.display(), error = %e, "Failed to quarantine checkpoint");
        }
    }

    fn checkpoint_files(&self) -> Result<Vec<PathBuf>> {
        list_matching(&self.dir, "*.json")
    }
}

fn list_matching(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = format!(
        "{}/{pattern}",
        glob::Pattern::escape(&dir.to_string_lossy())
    );
    let paths = glob::glob(&full)
        .map_err(|e| PerduraError::Internal(format!("Invalid glob pattern: {e}")))?
        .filter_map(|r| r.ok())
        .filter(|p| p.is_file())
        .collect();
    Ok(paths)
}

fn file_age(path: &Path) -> Duration {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CheckpointStore {
        let config = Config::default();
        CheckpointStore::open(dir.path(), "phase-1", &config).unwrap()
    }

    fn new_checkpoint(task: &str, pct: f64, resumable: bool) -> NewCheckpoint {
        NewCheckpoint {
            task_name: task.to_string(),
            query: "What moves the EV market?".to_string(),
            partial_result: json!("partial findings"),
            collected_items: vec![json!("https://a.com"), json!("https://b.com")],
            progress_pct: pct,
            resumable,
            metadata: CheckpointMetadata {
                source_count: 2,
                content_length: 16,
                reason: "scheduled".to_string(),
                extra: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let saved = store.save(new_checkpoint("market-overview", 30.0, true)).unwrap();
        let loaded = store.load("market-overview").unwrap().unwrap();

        assert_eq!(loaded, saved);
        assert_eq!(loaded.scope_id, "phase-1");
        assert_eq!(loaded.version, CHECKPOINT_VERSION);
        assert!(store.load("other-task").unwrap().is_none());
    }

    #[test]
    fn test_save_supersedes_and_backs_up() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.save(new_checkpoint("t", 10.0, true)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        store.save(new_checkpoint("t", 40.0, true)).unwrap();

        assert_eq!(store.load("t").unwrap().unwrap().progress_pct, 40.0);
        assert_eq!(store.list(false).unwrap().len(), 1);
        assert_eq!(store.backups_for("t").unwrap().len(), 2);
    }

    #[test]
    fn test_rejects_out_of_range_progress() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            store.save(new_checkpoint("t", 101.0, true)),
            Err(PerduraError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_corrupt_checkpoint_is_absent_and_quarantined() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let path = store.path_for("broken");
        fs::write(&path, b"{\"version\": 1, \"task_na").unwrap();

        match store.inspect("broken").unwrap() {
            CheckpointLookup::Corrupt { reason } => assert!(reason.contains("invalid JSON")),
            other => panic!("unexpected lookup: {other:?}"),
        }
        assert!(!path.exists());
        assert!(store.load("broken").unwrap().is_none());
        assert!(list_matching(store.dir(), "*.corrupt-*").unwrap().len() == 1);
    }

    #[test]
    fn test_crash_mid_write_keeps_previous_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(new_checkpoint("t", 20.0, true)).unwrap();

        // A writer died after creating its temp file but before the rename.
        let temp = store.dir().join(".t.json.0000.tmp");
        fs::write(&temp, b"{\"version\": 1, \"progress_pct\": 9").unwrap();

        let loaded = store.load("t").unwrap().unwrap();
        assert_eq!(loaded.progress_pct, 20.0);
        assert_eq!(store.list(false).unwrap().len(), 1);
    }

    #[test]
    fn test_newer_version_is_not_trusted() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut cp = store.save(new_checkpoint("t", 20.0, true)).unwrap();
        cp.version = CHECKPOINT_VERSION + 1;
        write_json_atomic(&store.path_for("t"), &cp).unwrap();

        assert!(matches!(
            store.inspect("t").unwrap(),
            CheckpointLookup::Corrupt { .. }
        ));
    }

    #[test]
    fn test_list_filters_and_orders() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(new_checkpoint("first", 10.0, true)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        store.save(new_checkpoint("second", 90.0, false)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        store.save(new_checkpoint("third", 50.0, true)).unwrap();

        let all: Vec<_> = store
            .list(false)
            .unwrap()
            .into_iter()
            .map(|c| c.task_name)
            .collect();
        assert_eq!(all, vec!["third", "second", "first"]);

        let resumable: Vec<_> = store
            .list(true)
            .unwrap()
            .into_iter()
            .map(|c| c.task_name)
            .collect();
        assert_eq!(resumable, vec!["third", "first"]);
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(new_checkpoint("t", 10.0, true)).unwrap();
        assert!(store.delete("t").unwrap());
        assert!(!store.delete("t").unwrap());
        assert!(store.locks.is_empty());
        assert!(store.load("t").unwrap().is_none());
    }

    #[test]
    fn test_expire_removes_old_checkpoints() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut old = store.save(new_checkpoint("old", 10.0, true)).unwrap();
        old.created_at = Utc::now() - chrono::Duration::days(10);
        write_json_atomic(&store.path_for("old"), &old).unwrap();
        store.save(new_checkpoint("fresh", 10.0, true)).unwrap();

        let report = store.expire(Duration::from_secs(7 * 24 * 3600)).unwrap();
        assert_eq!(report.checkpoints, 1);
        assert!(store.load("old").unwrap().is_none());
        assert!(store.load("fresh").unwrap().is_some());

        // Everything is older than a zero window.
        std::thread::sleep(Duration::from_millis(5));
        let report = store.expire(Duration::ZERO).unwrap();
        assert_eq!(report.checkpoints, 1);
        assert_eq!(report.backups, 2);
    }

    #[test]
    fn test_resume_context_only_for_resumable() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.save(new_checkpoint("late", 90.0, false)).unwrap();
        assert!(store.build_resume_context("late").unwrap().is_none());

        store.save(new_checkpoint("early", 30.0, true)).unwrap();
        let brief = store.build_resume_context("early").unwrap().unwrap();
        assert!(brief.contains("What moves the EV market?"));
        assert!(brief.contains("30%"));
    }

    #[test]
    fn test_verify_continuation_against_stored_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save(new_checkpoint("t", 30.0, true)).unwrap();

        let redo = TaskOutput::new(json!("done"), vec![json!("https://a.com"), json!("https://b.com")]);
        let check = store.verify_continuation("t", &redo).unwrap().unwrap();
        assert!(!check.verified);

        let fresh = TaskOutput::new(json!("done"), vec![json!("https://z.com")]);
        assert!(store.verify_continuation("t", &fresh).unwrap().unwrap().verified);
    }

    #[test]
    fn test_estimate_savings_uses_schedule() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let cp = store.save(new_checkpoint("t", 25.0, true)).unwrap();
        // Default schedule: 25% is reached at 300s.
        assert_eq!(store.estimate_savings(&cp).time_invested, Duration::from_secs(300));
    }
}
