//! backupctl: runs the backup scheduler or performs one backup operation.

mod daemon;
mod utils;

use anyhow::Context;
use backup_orchestrator::config::AppConfig;
use backup_orchestrator::models::backup_config::BackupConfiguration;
use backup_orchestrator::models::backup_job::JobType;
use backup_orchestrator::models::restore_job::RestoreOptions;
use backup_orchestrator::models::Actor;
use backup_orchestrator::services::backup_scheduler::BackupScheduler;
use backup_orchestrator::services::executor::BackupRequest;
use backup_orchestrator::{AppState, BackupError};
use clap::{Parser, Subcommand};
use daemon::shutdown::{ShutdownCoordinator, DRAIN_TIMEOUT};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Load environment variables from this file before reading settings
    #[arg(long, global = true, value_name = "FILE")]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler, watchdog and statistics refresh until SIGINT/SIGTERM
    Serve,
    /// Take a manual backup now
    Run {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// Who requested the backup (defaults to $USER)
        #[arg(long)]
        user: Option<String>,
        /// Mark the backup as an emergency backup
        #[arg(long)]
        emergency: bool,
        /// Run even when preflight diagnostics fail
        #[arg(long)]
        force: bool,
    },
    /// Restore a completed backup into the configured database
    Restore {
        backup_id: String,
        /// Restore only this table (repeatable)
        #[arg(long = "table", value_name = "TABLE")]
        tables: Vec<String>,
        /// Drop existing objects before recreating them
        #[arg(long)]
        clean: bool,
        #[arg(long)]
        user: Option<String>,
    },
    /// Run preflight diagnostics
    Diagnose,
    /// Apply the retention policy now
    Sweep,
    /// Show or replace the backup policy
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List backup jobs, newest first
    Jobs {
        /// Include tombstoned backups
        #[arg(long)]
        include_deleted: bool,
    },
    /// List restore jobs
    Restores {
        /// Only restores of this backup
        #[arg(long = "backup", value_name = "BACKUP_ID")]
        backup_id: Option<String>,
    },
    /// Delete a finished backup and its file
    Delete { backup_id: String },
    /// Show backup statistics
    Stats,
    /// Fail jobs stuck beyond the configured ceiling
    Watchdog,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    /// Replace the policy with the JSON document in FILE
    Set {
        #[arg(long, value_name = "FILE")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    if let Some(path) = &args.env_file {
        dotenvy::from_path(path).with_context(|| format!("Failed to load {}", path.display()))?;
    }
    let config = AppConfig::from_env();
    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    utils::logger::init(log_level)?;

    let state = Arc::new(AppState::open(config).await?);
    let code = execute(args.command, state.clone()).await;
    state.close();
    code
}

async fn execute(command: Command, state: Arc<AppState>) -> anyhow::Result<ExitCode> {
    match command {
        Command::Serve => {
            serve(state).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            name,
            description,
            user,
            emergency,
            force,
        } => {
            let request = BackupRequest {
                job_type: if emergency { JobType::Emergency } else { JobType::Manual },
                name,
                description,
                triggered_by: Actor::user(user.unwrap_or_else(current_user)),
            };
            match state.run_manual(request, force).await {
                Ok(job) => print_json(&job),
                Err(BackupError::NotReady(reason)) => {
                    eprintln!("{reason}");
                    Ok(ExitCode::from(2))
                }
                Err(BackupError::BackupFailed(job)) => {
                    print_json(&job)?;
                    Ok(ExitCode::FAILURE)
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Restore {
            backup_id,
            tables,
            clean,
            user,
        } => {
            let options = RestoreOptions { tables, clean };
            let requested_by = Actor::user(user.unwrap_or_else(current_user));
            match state.restore.restore(&backup_id, options, requested_by).await {
                Ok(job) => print_json(&job),
                Err(BackupError::RestoreFailed(job)) => {
                    print_json(&job)?;
                    Ok(ExitCode::FAILURE)
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Diagnose => {
            let report = state.diagnose().await?;
            print_json(&report)?;
            Ok(if report.ready { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Sweep => print_json(&state.retention.sweep_now().await?),
        Command::Config { action } => match action {
            ConfigAction::Show => print_json(&state.config_store.get().await?),
            ConfigAction::Set { file } => {
                let raw = tokio::fs::read_to_string(&file)
                    .await
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                let policy: BackupConfiguration =
                    serde_json::from_str(&raw).with_context(|| format!("Invalid policy in {}", file.display()))?;
                print_json(&state.config_store.update(policy).await?)
            }
        },
        Command::Jobs { include_deleted } => print_json(&state.list_backups(include_deleted).await?),
        Command::Restores { backup_id } => print_json(&state.list_restores(backup_id).await?),
        Command::Delete { backup_id } => print_json(&state.delete_backup(&backup_id).await?),
        Command::Stats => print_json(&state.statistics.current().await?),
        Command::Watchdog => print_json(&state.watchdog.sweep().await?),
    }
}

async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let shutdown = ShutdownCoordinator::new();
    let token = shutdown.token();
    tokio::spawn(async move { shutdown.wait_for_signal().await });

    tracing::info!("Starting backup scheduler v{}", env!("CARGO_PKG_VERSION"));

    // Automatic jobs still open now have no worker; unblock the trigger
    if let Err(e) = state.watchdog.recover_orphans().await {
        tracing::warn!(error = %e, "Startup orphan recovery failed");
    }
    match state.watchdog.sweep().await {
        Ok(report) if report.failed_backups + report.failed_restores > 0 => {
            tracing::warn!(?report, "Recovered stuck jobs at startup");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Startup watchdog sweep failed"),
    }
    if let Err(e) = state.statistics.refresh().await {
        tracing::warn!(error = %e, "Initial statistics refresh failed");
    }
    match state.diagnose().await {
        Ok(report) if !report.ready => tracing::warn!(
            reason = report.first_failure().unwrap_or_default(),
            "Preflight diagnostics failing; automatic backups will be recorded as failed"
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Preflight diagnostics could not run"),
    }

    let scheduler = BackupScheduler::new(state.clone()).await?;
    scheduler.init_schedules().await?;
    scheduler.start().await?;
    tracing::info!("Backup scheduler running");

    token.cancelled().await;

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "Scheduler shutdown error");
    }

    let drain = async {
        while state.trigger.is_running() {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("Automatic backup still running at shutdown; it will be failed by the next watchdog sweep");
    }

    tracing::info!("Backup scheduler stopped");
    Ok(())
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.trim().is_empty() && u != "system")
        .unwrap_or_else(|| "operator".into())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(ExitCode::SUCCESS)
}
