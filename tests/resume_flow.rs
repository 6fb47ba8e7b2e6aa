//! End-to-end interrupt/resume behavior through the public API.

use perdura::progress::ProgressStatus;
use perdura::retry::CircuitState;
use perdura::{
    from_fn, BreakerRegistry, Config, ErrorKind, OperationContext, OperationError,
    ProgressTracker, ResumableExecutor, ScheduleEntry, TaskOutput, TaskRequest, TaskState,
};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const TASK: &str = "market-overview";
const QUERY: &str = "Summarize the EV battery market";

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.checkpoint_dir = dir.join("checkpoints");
    config.progress_dir = dir.join("progress");
    config.checkpoint_schedule = vec![
        ScheduleEntry::new(10, 30.0, "gathering", true),
        ScheduleEntry::new(40, 60.0, "analysis", true),
    ];
    config.checkpoint_check_interval = 5.0;
    config.max_retries = 2;
    config.base_retry_delay = 1.0;
    config.max_retry_delay = 5.0;
    config.retry_jitter = 0.0;
    config
}

fn request() -> TaskRequest {
    TaskRequest::new(TASK, QUERY, "deep", Duration::from_secs(60))
}

/// Run a slow operation and drop it after `after`, as a process kill would.
async fn interrupt(executor: &ResumableExecutor, after: Duration) {
    let slow = from_fn(|ctx: OperationContext| async move {
        ctx.reporter.push_item(json!("https://a.com"));
        ctx.reporter.push_item(json!("https://b.com"));
        ctx.reporter.set_result(json!("draft covering cell chemistry"));
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(TaskOutput::new(json!("never"), vec![]))
    });
    let outcome = tokio::time::timeout(after, executor.execute(request(), &slow)).await;
    assert!(outcome.is_err(), "slow run should have been interrupted");
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_run_resumes_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let executor = ResumableExecutor::new(config(dir.path()), "phase-1").unwrap();

    interrupt(&executor, Duration::from_secs(15)).await;

    let saved = executor.store().load(TASK).unwrap().unwrap();
    assert_eq!(saved.progress_pct, 30.0);
    assert!(saved.resumable);
    assert_eq!(saved.query, QUERY);
    assert_eq!(saved.collected_items.len(), 2);

    let seen: Arc<Mutex<Vec<(bool, String, String)>>> = Arc::default();
    let resuming = {
        let seen = Arc::clone(&seen);
        from_fn(move |ctx: OperationContext| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock()
                    .unwrap()
                    .push((ctx.resumed, ctx.query.clone(), ctx.original_query.clone()));
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(TaskOutput::new(
                    json!("final report"),
                    vec![json!("https://c.com"), json!("https://d.com")],
                ))
            }
        })
    };

    let result = executor.execute(request(), &resuming).await.unwrap();
    assert!(result.resumed);
    assert_eq!(result.output.result, json!("final report"));
    assert_eq!(result.run.state, TaskState::Completed);
    assert!(result.run.query.contains("RESUMING INTERRUPTED TASK"));
    assert!((result.run.estimated_duration.as_secs_f64() - 42.0).abs() < 1e-6);

    let savings = result.time_saved.unwrap();
    assert_eq!(savings.progress_pct, 30.0);
    assert_eq!(savings.time_invested, Duration::from_secs(10));

    let check = result.verification.unwrap();
    assert!(check.verified);
    assert_eq!(check.previous_items, 2);
    assert_eq!(check.overlapping_items, 0);

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (resumed, query, original) = &seen[0];
        assert!(*resumed);
        assert!(query.contains("RESUMING INTERRUPTED TASK"));
        assert!(query.contains(QUERY));
        assert_eq!(original, QUERY);
    }

    assert!(executor.store().load(TASK).unwrap().is_none());

    let record = ProgressTracker::read(&executor.config().progress_dir, "phase-1", &result.task_id)
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ProgressStatus::Completed);
    assert!(record.resumed);
    assert_eq!(record.progress_pct, 100.0);
}

#[tokio::test(start_paused = true)]
async fn test_resumed_run_repeating_work_is_flagged() {
    let dir = TempDir::new().unwrap();
    let executor = ResumableExecutor::new(config(dir.path()), "phase-1").unwrap();

    interrupt(&executor, Duration::from_secs(15)).await;

    let restarting = from_fn(|_ctx: OperationContext| async {
        Ok(TaskOutput::new(
            json!("report"),
            vec![json!("https://a.com"), json!("https://b.com")],
        ))
    });
    let result = executor.execute(request(), &restarting).await.unwrap();
    let check = result.verification.unwrap();
    assert!(!check.verified);
    assert_eq!(check.overlap_ratio, 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_past_resumable_point_starts_fresh() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.checkpoint_schedule = vec![
        ScheduleEntry::new(10, 30.0, "gathering", true),
        ScheduleEntry::new(20, 85.0, "finalizing", false),
    ];
    let executor = ResumableExecutor::new(cfg, "phase-1").unwrap();

    interrupt(&executor, Duration::from_secs(25)).await;

    let saved = executor.store().load(TASK).unwrap().unwrap();
    assert_eq!(saved.progress_pct, 85.0);
    assert!(!saved.resumable);

    let fresh = from_fn(|ctx: OperationContext| async move {
        Ok(TaskOutput::new(json!({ "resumed": ctx.resumed, "query": ctx.query }), vec![]))
    });
    let result = executor.execute(request(), &fresh).await.unwrap();
    assert!(!result.resumed);
    assert!(result.time_saved.is_none());
    assert_eq!(result.output.result, json!({ "resumed": false, "query": QUERY }));
    assert!(executor.store().load(TASK).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failure_keeps_checkpoint_for_next_call() {
    let dir = TempDir::new().unwrap();
    let executor = ResumableExecutor::new(config(dir.path()), "phase-1").unwrap();

    interrupt(&executor, Duration::from_secs(15)).await;

    let broken = from_fn(|_ctx: OperationContext| async {
        Err::<TaskOutput, _>(OperationError::new("upstream unavailable").with_status(503))
    });
    let err = executor.execute(request(), &broken).await.unwrap_err();
    let failure = err.task_failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::Transient);
    assert_eq!(failure.checkpoint_pct, Some(30.0));
    assert!(failure.checkpoint_resumable);
    assert!(failure
        .recovery_hint()
        .contains("resumable checkpoint available at 30%"));

    let record = ProgressTracker::read(&executor.config().progress_dir, "phase-1", &failure.task_id)
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ProgressStatus::Failed);
    assert_eq!(record.error_type.as_deref(), Some("transient"));

    let kept = executor.store().load(TASK).unwrap().unwrap();
    assert_eq!(kept.progress_pct, 30.0);

    let ok = from_fn(|_ctx: OperationContext| async {
        Ok(TaskOutput::new(json!("report"), vec![]))
    });
    let result = executor.execute(request(), &ok).await.unwrap();
    assert!(result.resumed);
}

#[tokio::test(start_paused = true)]
async fn test_shared_breaker_rejects_across_executors() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.circuit_breaker_failure_threshold = 1;
    cfg.max_retries = 1;

    let breakers = Arc::new(BreakerRegistry::new(&cfg));
    let first = ResumableExecutor::new(cfg.clone(), "phase-1")
        .unwrap()
        .with_breakers(Arc::clone(&breakers));
    let second = ResumableExecutor::new(cfg, "phase-2")
        .unwrap()
        .with_breakers(Arc::clone(&breakers));

    let limited = from_fn(|_ctx: OperationContext| async {
        Err::<TaskOutput, _>(OperationError::new("Too Many Requests").with_status(429))
    });
    let err = first.execute(request(), &limited).await.unwrap_err();
    assert_eq!(err.task_failure().unwrap().kind, ErrorKind::RateLimit);
    assert_eq!(breakers.state("deep:primary"), CircuitState::Open);

    let calls = Arc::new(Mutex::new(0u32));
    let counted = {
        let calls = Arc::clone(&calls);
        from_fn(move |_ctx: OperationContext| {
            *calls.lock().unwrap() += 1;
            async { Ok(TaskOutput::new(json!("report"), vec![])) }
        })
    };
    let err = second.execute(request(), &counted).await.unwrap_err();
    let failure = err.task_failure().unwrap();
    assert!(failure.circuit_open);
    assert!(failure.cooldown.is_some());
    assert_eq!(*calls.lock().unwrap(), 0);

    tokio::time::advance(cfg_timeout() + Duration::from_secs(1)).await;
    let result = second.execute(request(), &counted).await.unwrap();
    assert_eq!(result.attempts, 1);
    assert_eq!(breakers.state("deep:primary"), CircuitState::Closed);
}

fn cfg_timeout() -> Duration {
    Config::default().circuit_breaker_timeout()
}
