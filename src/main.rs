//! perdura CLI - inspect and maintain checkpoints and progress records.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use perdura::checkpoint::CheckpointLookup;
use perdura::{CheckpointStore, Config, ProgressRecord, ProgressTracker};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "perdura")]
#[command(version)]
#[command(about = "Inspect and maintain resumable task checkpoints and progress")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults are used if it does not exist)
    #[arg(short, long, global = true, default_value = "perdura.toml")]
    config: PathBuf,

    /// Scope the tasks belong to (e.g. a phase id)
    #[arg(short, long, global = true, default_value = "default")]
    scope: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage saved checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Inspect progress records
    Progress {
        #[command(subcommand)]
        action: ProgressAction,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List checkpoints, newest first
    List {
        /// Only checkpoints a run would resume from
        #[arg(long)]
        resumable_only: bool,
    },

    /// Print one task's checkpoint as JSON
    Show {
        /// Task name
        task: String,
    },

    /// Delete one task's checkpoint
    Delete {
        /// Task name
        task: String,
    },

    /// Remove checkpoints, backups and quarantined files past their age
    Expire {
        /// Override the configured checkpoint_max_age (seconds)
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ProgressAction {
    /// List progress records
    List {
        /// Only runs still in progress
        #[arg(long)]
        active: bool,
    },

    /// Print one progress record as JSON
    Show {
        /// Task id
        task_id: String,
    },

    /// Follow a run until it completes or fails
    Watch {
        /// Task id
        task_id: String,

        /// Poll interval in seconds
        #[arg(short, long, default_value = "2")]
        interval: u64,
    },

    /// Delete finished records older than the configured retention
    Cleanup,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber already set");
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        debug!("No config at {:?}, using defaults", path);
        return Ok(Config::default());
    }
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            println!("{}", Config::example_toml());
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            info!("Configuration is valid");
            info!("  Max retries: {}", config.max_retries);
            info!(
                "  Retry delay: {:.1}s..{:.1}s (x{:.1}, jitter {:.0}%)",
                config.base_retry_delay,
                config.max_retry_delay,
                config.backoff_multiplier,
                config.retry_jitter * 100.0
            );
            info!(
                "  Circuit breaker: {} rate limits, {:.0}s cooldown",
                config.circuit_breaker_failure_threshold, config.circuit_breaker_timeout
            );
            info!("  Checkpoint dir: {:?}", config.checkpoint_dir);
            info!("  Progress dir: {:?}", config.progress_dir);
            for entry in &config.checkpoint_schedule {
                info!(
                    "  Checkpoint at {}s -> {:.0}% ({}{})",
                    entry.elapsed_sec,
                    entry.progress_pct,
                    entry.phase_name,
                    if entry.resumable { "" } else { ", not resumable" }
                );
            }
        }

        Commands::Checkpoints { action } => {
            let config = load_config(&cli.config)?;
            let store = CheckpointStore::new(&config, &cli.scope)
                .context("Failed to open checkpoint store")?;

            match action {
                CheckpointAction::List { resumable_only } => {
                    let checkpoints = store.list(resumable_only)?;
                    if checkpoints.is_empty() {
                        println!("No checkpoints in scope '{}'", cli.scope);
                    }
                    for cp in checkpoints {
                        println!(
                            "{:<32} {:>5.1}%  {:<9} {:>6}s old  {} items",
                            cp.task_name,
                            cp.progress_pct,
                            if cp.resumable { "resumable" } else { "final" },
                            cp.age().as_secs(),
                            cp.collected_items.len()
                        );
                    }
                }

                CheckpointAction::Show { task } => match store.inspect(&task)? {
                    CheckpointLookup::Found(cp) => {
                        println!("{}", serde_json::to_string_pretty(&cp)?);
                        println!("\n{}", store.estimate_savings(&cp).summary());
                    }
                    CheckpointLookup::Missing => println!("No checkpoint for '{task}'"),
                    CheckpointLookup::Corrupt { reason } => {
                        println!("Checkpoint for '{task}' was unreadable and has been quarantined: {reason}");
                    }
                },

                CheckpointAction::Delete { task } => {
                    if store.delete(&task)? {
                        println!("Deleted checkpoint for '{task}'");
                    } else {
                        println!("No checkpoint for '{task}'");
                    }
                }

                CheckpointAction::Expire { max_age_secs } => {
                    let max_age = max_age_secs
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| config.checkpoint_max_age());
                    let report = store.expire(max_age)?;
                    println!("Checkpoints: {}", report.checkpoints);
                    println!("Backups:     {}", report.backups);
                    println!("Quarantined: {}", report.quarantined);
                }
            }
        }

        Commands::Progress { action } => {
            let config = load_config(&cli.config)?;
            let root = &config.progress_dir;

            match action {
                ProgressAction::List { active } => {
                    let records = if active {
                        ProgressTracker::list_active(root, &cli.scope)?
                    } else {
                        ProgressTracker::list(root, &cli.scope)?
                    };
                    if records.is_empty() {
                        println!("No progress records in scope '{}'", cli.scope);
                    }
                    for record in records {
                        println!(
                            "{:<48} {:<9} {:>5.1}%  {}",
                            record.task_id, record.status, record.progress_pct, record.current_action
                        );
                    }
                }

                ProgressAction::Show { task_id } => {
                    let record = ProgressTracker::read(root, &cli.scope, &task_id)?
                        .with_context(|| format!("No progress record for '{task_id}'"))?;
                    println!("{}", serde_json::to_string_pretty(&record)?);
                }

                ProgressAction::Watch { task_id, interval } => {
                    watch(root, &cli.scope, &task_id, Duration::from_secs(interval.max(1))).await?;
                }

                ProgressAction::Cleanup => {
                    let removed =
                        ProgressTracker::cleanup_finished(root, &cli.scope, config.progress_retention())?;
                    println!("Removed {removed} finished progress records");
                }
            }
        }
    }

    Ok(())
}

/// Polls a missing record may take before `watch` gives up.
const MISSING_POLLS: u32 = 5;

async fn watch(root: &Path, scope: &str, task_id: &str, interval: Duration) -> Result<()> {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .context("Invalid progress template")?
            .progress_chars("#>-"),
    );

    let record: ProgressRecord = loop {
        let record = ProgressTracker::read_patiently(root, scope, task_id, MISSING_POLLS, interval)
            .await?
            .with_context(|| format!("No progress record for '{task_id}'"))?;
        pb.set_position(record.progress_pct.round() as u64);
        pb.set_message(format!("{}: {}", record.phase, record.current_action));
        if record.is_terminal() {
            break record;
        }
        tokio::time::sleep(interval).await;
    };
    pb.finish_with_message(format!("{}", record.status));

    println!("\n=== {} ===", record.task_name);
    println!("Status:   {}", record.status);
    println!("Resumed:  {}", record.resumed);
    println!("Runtime:  {:.1}s", record.elapsed().as_secs_f64());
    println!("Checkpoints: {}", record.checkpoint_history.len());
    if let Some(error) = &record.error {
        println!(
            "Error:    {} ({})",
            error,
            record.error_type.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}
