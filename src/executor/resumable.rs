//! Resumable executor.
//!
//! One call runs one task to a terminal outcome:
//! 1. Load the task's checkpoint; resume from it when resumable and fresh
//! 2. Start progress tracking with the effective query and remaining estimate
//! 3. Run the operation through the retry controller while a background
//!    loop saves scheduled checkpoints
//! 4. Stop and join the loop before any terminal bookkeeping
//! 5. Success deletes the checkpoint; failure keeps it for the next call

use super::checkpoint_loop::{plan_schedule, CheckpointLoop, LoopReport};
use super::{
    Operation, OperationClass, OperationContext, PartialReporter, PartialState, ProgressReporter,
};
use crate::checkpoint::{self, Checkpoint, CheckpointStore, ContinuationCheck, TimeSavings};
use crate::models::{
    Config, PerduraError, Result, TaskFailure, TaskOutput, TaskRequest, TaskRun,
};
use crate::progress::{ProgressRecord, ProgressTracker};
use crate::retry::{
    Attempted, BreakerRegistry, BreakerSnapshot, ErrorKind, RetryController, RetryError,
    RetryEvent, RetryStats,
};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub task_id: String,
    pub output: TaskOutput,
    /// Whether the run continued from a checkpoint
    pub resumed: bool,
    /// Work the checkpoint spared, when resumed
    pub time_saved: Option<TimeSavings>,
    /// Overlap check against the checkpoint, when resumed
    pub verification: Option<ContinuationCheck>,
    pub used_fallback: bool,
    /// Operation invocations across primary and fallback
    pub attempts: u32,
    pub checkpoints_saved: u32,
    /// The run as executed: effective query, final lifecycle state
    pub run: TaskRun,
}

struct Invoked {
    output: TaskOutput,
    attempts: u32,
    used_fallback: bool,
}

/// Runs tasks so that interrupted work is resumed rather than redone.
#[derive(Debug)]
pub struct ResumableExecutor {
    config: Config,
    scope_id: String,
    store: Arc<CheckpointStore>,
    retry: RetryController,
    last_cleanup: Mutex<Option<Instant>>,
}

impl ResumableExecutor {
    /// Build an executor for one scope (e.g. one phase of a plan).
    pub fn new(config: Config, scope_id: &str) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(CheckpointStore::new(&config, scope_id)?);
        let retry = RetryController::new(&config);
        Ok(Self {
            config,
            scope_id: scope_id.to_string(),
            store,
            retry,
            last_cleanup: Mutex::new(None),
        })
    }

    /// Share circuit breakers with other executors.
    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.retry = RetryController::with_breakers(&self.config, breakers);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        self.retry.breakers()
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.retry.stats()
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.retry.breakers().snapshots()
    }

    /// Runs still in progress in this scope.
    pub fn list_active(&self) -> Result<Vec<ProgressRecord>> {
        ProgressTracker::list_active(&self.config.progress_dir, &self.scope_id)
    }

    /// Run `primary` to completion, resuming from a checkpoint if possible.
    pub async fn execute(
        &self,
        request: TaskRequest,
        primary: &dyn Operation,
    ) -> Result<ExecutionResult> {
        self.run(request, primary, None).await
    }

    /// Like [`execute`](Self::execute), falling back to `fallback` once when
    /// the primary gives up on a non-fatal error.
    pub async fn execute_with_fallback(
        &self,
        request: TaskRequest,
        primary: &dyn Operation,
        fallback: &dyn Operation,
    ) -> Result<ExecutionResult> {
        self.run(request, primary, Some(fallback)).await
    }

    async fn run(
        &self,
        request: TaskRequest,
        primary: &dyn Operation,
        fallback: Option<&dyn Operation>,
    ) -> Result<ExecutionResult> {
        if request.task_name.trim().is_empty() {
            return Err(PerduraError::InvalidInput(
                "task name must not be empty".to_string(),
            ));
        }
        self.maybe_cleanup();

        let mut run = TaskRun::new(&request);
        let resume_from = self.resumable_checkpoint(&request.task_name)?;
        let time_saved = resume_from.as_ref().map(|cp| self.store.estimate_savings(cp));

        if let (Some(cp), Some(savings)) = (&resume_from, &time_saved) {
            run.resumed = true;
            run.query = checkpoint::render_resume_context(cp);
            let remaining = (1.0 - cp.progress_pct / 100.0).clamp(0.0, 1.0);
            run.estimated_duration = request.estimated_duration.mul_f64(remaining);
            info!(
                task_name = %request.task_name,
                progress_pct = cp.progress_pct,
                age_secs = cp.age().as_secs(),
                savings = %savings.summary(),
                "Resuming from checkpoint"
            );
        }

        let tracker = Arc::new(ProgressTracker::start(
            &self.config.progress_dir,
            &self.scope_id,
            &run,
        )?);
        run.state = tracker.state()?;
        if let Some(cp) = &resume_from {
            tracker.update(
                "resuming",
                &format!("Resuming from {:.0}% checkpoint", cp.progress_pct),
                cp.progress_pct,
                false,
            )?;
        }

        let seed = resume_from
            .as_ref()
            .map(|cp| PartialState {
                partial_result: cp.partial_result.clone(),
                collected_items: cp.collected_items.clone(),
            })
            .unwrap_or_default();
        let (reporter, partial_rx) = PartialReporter::channel(seed);

        let offset = resume_from
            .as_ref()
            .zip(time_saved.as_ref())
            .map(|(cp, savings)| (cp.progress_pct, savings.time_invested));
        let checkpoint_loop = CheckpointLoop {
            store: Arc::clone(&self.store),
            tracker: Arc::clone(&tracker),
            partial: partial_rx,
            task_name: request.task_name.clone(),
            query: request.query.clone(),
            plan: plan_schedule(&self.config.checkpoint_schedule, offset),
            check_interval: self.config.checkpoint_check_interval(),
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(checkpoint_loop.run(cancel.clone()));
        // Also fires if this future is dropped mid-run.
        let stop_loop = cancel.drop_guard();

        let outcome = self
            .invoke(&run, &request.query, &tracker, &reporter, primary, fallback)
            .await;

        drop(stop_loop);
        let loop_report = match handle.await {
            Ok(report) => report,
            Err(e) => {
                warn!(task_name = %request.task_name, error = %e, "Checkpoint loop did not finish cleanly");
                LoopReport::default()
            }
        };

        match outcome {
            Ok(invoked) => {
                // Output is final from here; bookkeeping errors are only logged.
                if let Err(e) = tracker.complete(invoked.output.result.clone()) {
                    warn!(task_id = %tracker.task_id(), error = %e, "Could not record completion in progress");
                }
                if let Err(e) = self.store.delete(&request.task_name) {
                    warn!(task_name = %request.task_name, error = %e, "Could not delete checkpoint after success");
                }
                if let Ok(state) = tracker.state() {
                    run.state = state;
                }

                let verification = resume_from
                    .as_ref()
                    .map(|cp| checkpoint::check_continuation(cp, &invoked.output.collected_items));
                if let Some(check) = &verification {
                    if check.verified {
                        info!(task_name = %request.task_name, note = %check.note, "Resume verified");
                    } else {
                        warn!(
                            task_name = %request.task_name,
                            overlap = check.overlap_ratio,
                            note = %check.note,
                            "Resumed run looks like a restart"
                        );
                    }
                }

                Ok(ExecutionResult {
                    task_id: tracker.task_id().to_string(),
                    output: invoked.output,
                    resumed: run.resumed,
                    time_saved,
                    verification,
                    used_fallback: invoked.used_fallback,
                    attempts: invoked.attempts,
                    checkpoints_saved: loop_report.checkpoints_saved,
                    run,
                })
            }
            Err(error) => Err(self.fail(&request, &tracker, error)),
        }
    }

    async fn invoke(
        &self,
        run: &TaskRun,
        original_query: &str,
        tracker: &Arc<ProgressTracker>,
        reporter: &PartialReporter,
        primary: &dyn Operation,
        fallback: Option<&dyn Operation>,
    ) -> std::result::Result<Invoked, RetryError> {
        let context = |class: OperationClass, attempt: u32| OperationContext {
            task_id: tracker.task_id().to_string(),
            task_name: run.task_name.clone(),
            query: run.query.clone(),
            original_query: original_query.to_string(),
            provider: run.provider.clone(),
            class,
            attempt,
            resumed: run.resumed,
            reporter: reporter.clone(),
            progress: ProgressReporter::new(Arc::clone(tracker)),
        };
        let on_retry = |event: &RetryEvent<'_>| {
            let action = format!(
                "Retrying after {} error (attempt {}/{}, waiting {}s)",
                event.kind,
                event.attempt + 1,
                event.max_retries,
                event.delay.as_secs()
            );
            if let Err(e) = tracker.set_action(&action) {
                debug!(error = %e, "Could not record retry in progress");
            }
        };

        let primary_key = OperationClass::Primary.breaker_key(&run.provider);
        let primary_error = match self
            .retry
            .run_with_backoff(
                &primary_key,
                |attempt| {
                    let ctx = context(OperationClass::Primary, attempt);
                    async move { primary.execute(&ctx).await }
                },
                on_retry,
            )
            .await
        {
            Ok(Attempted { value, attempts }) => {
                return Ok(Invoked {
                    output: value,
                    attempts,
                    used_fallback: false,
                })
            }
            Err(e) => e,
        };

        let Some(fallback) = fallback else {
            return Err(primary_error);
        };
        if primary_error.kind() == ErrorKind::Fatal {
            return Err(primary_error);
        }

        warn!(
            task_name = %run.task_name,
            error = %primary_error,
            "Primary operation gave up, trying fallback"
        );
        if let Err(e) = tracker.set_action("Primary failed, running fallback") {
            debug!(error = %e, "Could not record fallback in progress");
        }

        let fallback_key = OperationClass::Fallback.breaker_key(&run.provider);
        match self
            .retry
            .run_once(&fallback_key, |attempt| {
                let ctx = context(OperationClass::Fallback, attempt);
                async move { fallback.execute(&ctx).await }
            })
            .await
        {
            Ok(Attempted { value, attempts }) => Ok(Invoked {
                output: value,
                attempts: primary_error.attempts() + attempts,
                used_fallback: true,
            }),
            Err(e) => {
                warn!(task_name = %run.task_name, error = %e, "Fallback operation failed");
                Err(primary_error)
            }
        }
    }

    /// Record the failure and build the caller-facing error. The checkpoint
    /// is left in place.
    fn fail(&self, request: &TaskRequest, tracker: &ProgressTracker, error: RetryError) -> PerduraError {
        let kind = error.kind();
        let kept = match self.store.load(&request.task_name) {
            Ok(cp) => cp,
            Err(e) => {
                warn!(task_name = %request.task_name, error = %e, "Could not read checkpoint after failure");
                None
            }
        };
        let cooldown = error.retry_after().or_else(|| {
            (kind == ErrorKind::RateLimit).then(|| self.config.circuit_breaker_timeout())
        });

        let failure = TaskFailure {
            task_name: request.task_name.clone(),
            task_id: tracker.task_id().to_string(),
            kind,
            circuit_open: error.is_circuit_open(),
            message: error.to_string(),
            checkpoint_pct: kept.as_ref().map(|cp| cp.progress_pct),
            checkpoint_resumable: kept.as_ref().is_some_and(|cp| cp.resumable),
            cooldown,
        };

        if let Err(e) = tracker.fail(&failure.message, failure.error_type()) {
            warn!(task_id = %failure.task_id, error = %e, "Could not record failure in progress");
        }
        warn!(
            task_name = %failure.task_name,
            error_type = failure.error_type(),
            recovery = %failure.recovery_hint(),
            "Task failed"
        );
        PerduraError::TaskFailed(Box::new(failure))
    }

    fn resumable_checkpoint(&self, task_name: &str) -> Result<Option<Checkpoint>> {
        let Some(cp) = self.store.load(task_name)? else {
            return Ok(None);
        };
        if !cp.resumable {
            info!(
                task_name,
                progress_pct = cp.progress_pct,
                "Checkpoint is past the resumable point, starting fresh"
            );
            return Ok(None);
        }
        if !cp.can_resume(self.config.resume_max_age()) {
            info!(
                task_name,
                age_secs = cp.age().as_secs(),
                "Checkpoint too old to resume, starting fresh"
            );
            return Ok(None);
        }
        Ok(Some(cp))
    }

    /// Expire old checkpoints and progress records, at most once per
    /// cleanup interval.
    fn maybe_cleanup(&self) {
        {
            let Ok(mut last) = self.last_cleanup.lock() else {
                return;
            };
            let interval = self.config.checkpoint_cleanup_interval();
            if last.is_some_and(|t| t.elapsed() < interval) {
                return;
            }
            *last = Some(Instant::now());
        }

        if let Err(e) = self.store.expire(self.config.checkpoint_max_age()) {
            warn!(scope = %self.scope_id, error = %e, "Checkpoint expiry failed");
        }
        if let Err(e) = ProgressTracker::cleanup_finished(
            &self.config.progress_dir,
            &self.scope_id,
            self.config.progress_retention(),
        ) {
            warn!(scope = %self.scope_id, error = %e, "Progress cleanup failed");
        }
    }
}
