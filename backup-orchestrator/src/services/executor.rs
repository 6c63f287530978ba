//! Backup executor.
//!
//! Creates the job row, shells out to the dump tool and finalizes the row.
//! Every failure after the row exists ends as a FAILED job and is returned as
//! [`BackupError::BackupFailed`].

use crate::config::ToolSettings;
use crate::db::{with_conn, DbPool};
use crate::error::{BackupError, Result};
use crate::models::backup_config::BackupConfiguration;
use crate::models::backup_job::{self, BackupJob, Completion, JobType, NewBackupJob};
use crate::models::{Actor, JobState};
use crate::services::config_store::ConfigStore;
use crate::services::diagnostics::{check_connection_string, locate_tool};
use crate::services::notify::{self, Notifier};
use crate::services::process::{truncate_message, CommandSpec, ProcessError, ProcessRunner};
use crate::services::retention::remove_artifact;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Stored error messages are cut to this many characters.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 1000;
const MAX_NAME_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub job_type: JobType,
    pub name: String,
    pub description: Option<String>,
    pub triggered_by: Actor,
}

impl BackupRequest {
    pub fn manual(name: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            job_type: JobType::Manual,
            name: name.into(),
            description: None,
            triggered_by: Actor::user(user),
        }
    }

    /// Request issued by the scheduler for the local minute it fired in.
    pub fn automatic(minute: NaiveDateTime) -> Self {
        Self {
            job_type: JobType::Automatic,
            name: format!("automatic-{}", minute.format("%Y%m%d-%H%M")),
            description: Some("Scheduled automatic backup".into()),
            triggered_by: Actor::System,
        }
    }

    fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(BackupError::Validation("name is required".into()));
        }
        if name.chars().count() > MAX_NAME_CHARS {
            return Err(BackupError::Validation(format!(
                "name must be at most {MAX_NAME_CHARS} characters"
            )));
        }
        self.triggered_by.validate().map_err(BackupError::Validation)
    }
}

#[derive(Clone)]
pub struct BackupExecutor {
    db: DbPool,
    config_store: ConfigStore,
    runner: Arc<dyn ProcessRunner>,
    notifier: Arc<dyn Notifier>,
    tools: ToolSettings,
}

impl BackupExecutor {
    pub fn new(
        db: DbPool,
        config_store: ConfigStore,
        runner: Arc<dyn ProcessRunner>,
        notifier: Arc<dyn Notifier>,
        tools: ToolSettings,
    ) -> Self {
        Self {
            db,
            config_store,
            runner,
            notifier,
            tools,
        }
    }

    pub async fn run(&self, request: BackupRequest) -> Result<BackupJob> {
        request.validate()?;
        let config = self.config_store.get().await?;

        let started_at = Utc::now();
        let new_job = NewBackupJob {
            name: request.name.trim().to_string(),
            description: request.description.clone().filter(|d| !d.trim().is_empty()),
            job_type: request.job_type,
            created_by: request.triggered_by.clone(),
            started_at,
        };
        let job = with_conn(&self.db, move |conn| {
            let job = backup_job::create(conn, &new_job)?;
            backup_job::mark_in_progress(conn, &job.id)?;
            Ok(job)
        })
        .await?;

        tracing::info!(
            job_id = %job.id,
            name = %job.name,
            job_type = %job.job_type,
            created_by = %job.created_by,
            "Backup started"
        );

        let outcome = self.dump(&job, &config, &started_at).await;
        let finished_at = Utc::now();
        let duration_seconds = (finished_at - started_at).num_seconds().max(0);
        let job_id = job.id.clone();

        let finished = match outcome {
            Ok((path, size_bytes)) => {
                let completion = Completion {
                    file_path: path.to_string_lossy().to_string(),
                    size_bytes,
                    duration_seconds,
                    finished_at,
                };
                let id = job_id.clone();
                match with_conn(&self.db, move |conn| backup_job::complete(conn, &id, &completion)).await {
                    Ok(()) => {
                        let finished = with_conn(&self.db, move |conn| reload(conn, &job_id)).await?;
                        tracing::info!(
                            job_id = %finished.id,
                            size_bytes,
                            duration_seconds,
                            path = %path.display(),
                            "Backup completed"
                        );
                        finished
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job.id, error = %e, "Failed to record backup completion");
                        if let Err(rm) = remove_artifact(&path).await {
                            tracing::warn!(job_id = %job.id, error = %rm, "Failed to remove unrecorded dump output");
                        }
                        let message = format!("Failed to record completion: {e}");
                        self.record_failure(job_id, message, finished_at, duration_seconds).await?
                    }
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Backup failed");
                self.record_failure(job_id, e.to_string(), finished_at, duration_seconds).await?
            }
        };

        notify::dispatch(&self.notifier, &config, &finished);

        match finished.state {
            JobState::Completed => Ok(finished),
            _ => Err(BackupError::BackupFailed(Box::new(finished))),
        }
    }

    async fn record_failure(
        &self,
        job_id: String,
        message: String,
        finished_at: DateTime<Utc>,
        duration_seconds: i64,
    ) -> Result<BackupJob> {
        let message = truncate_message(&message, MAX_ERROR_MESSAGE_CHARS);
        with_conn(&self.db, move |conn| {
            backup_job::fail(conn, &job_id, &message, &finished_at, duration_seconds)?;
            reload(conn, &job_id)
        })
        .await
    }

    /// Run the dump tool; returns the artifact path and its size.
    async fn dump(&self, job: &BackupJob, config: &BackupConfiguration, started_at: &DateTime<Utc>) -> Result<(PathBuf, i64)> {
        let connection = check_connection_string(self.tools.database_url.expose());
        if !connection.ok {
            return Err(BackupError::Validation(connection.message));
        }
        if config.encrypt && self.tools.encrypt_args.is_empty() {
            return Err(BackupError::ToolUnavailable(
                "encryption was requested but no encryption arguments are configured (DUMP_ENCRYPT_ARGS)".into(),
            ));
        }

        let dir = PathBuf::from(&config.local_path);
        let stem = format!("{}_{}", started_at.format("%Y%m%d-%H%M%S"), slugify(&job.name));
        let suffix: String = job.id.chars().take(8).collect();
        let ext = extension(config);
        let output = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
            std::fs::create_dir_all(&dir)?;
            reserve_output(&dir, &stem, &suffix, ext)
        })
        .await??;

        let program = locate_tool(&self.tools.dump_tool).await;
        let command = self.dump_command(program, config, &output);
        tracing::debug!(job_id = %job.id, command = %command.display(), "Invoking dump tool");

        let result = self.invoke(&command, &output).await;
        if result.is_err() {
            // the reserved file belongs to this run only
            match remove_artifact(&output).await {
                Ok(()) => tracing::debug!(job_id = %job.id, "Removed partial dump output"),
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Failed to remove partial dump output"),
            }
        }
        result.map(|size| (output, size))
    }

    async fn invoke(&self, command: &CommandSpec, output: &Path) -> Result<i64> {
        let tool = &self.tools.dump_tool;
        let out = self
            .runner
            .run(command, self.tools.dump_timeout)
            .await
            .map_err(|e| tool_error(tool, e))?;

        if !out.success() {
            return Err(BackupError::ToolExecution(format!(
                "{tool} exited with {}: {}",
                out.exit_code.map_or("a signal".to_string(), |c| format!("code {c}")),
                out.stderr.trim()
            )));
        }

        let size = match tokio::fs::metadata(output).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(BackupError::ToolExecution(format!(
                    "{tool} reported success but wrote no output file"
                )))
            }
        };
        if size == 0 {
            return Err(BackupError::ToolExecution(format!("{tool} produced an empty output file")));
        }
        Ok(size as i64)
    }

    fn dump_command(&self, program: PathBuf, config: &BackupConfiguration, output: &Path) -> CommandSpec {
        let mut cmd = CommandSpec::new(program).arg("--no-password");

        cmd = if config.compress {
            cmd.arg("--format=custom")
                .arg(format!("--compress={}", config.compression_level))
        } else {
            cmd.arg("--format=tar")
        };
        cmd = cmd.arg(format!("--file={}", output.display()));
        for table in &config.excluded_tables {
            cmd = cmd.arg(format!("--exclude-table={table}"));
        }
        if config.encrypt {
            for arg in &self.tools.encrypt_args {
                cmd = cmd.arg(arg);
            }
        }
        cmd = cmd.arg(format!("--dbname={}", self.tools.database_url.without_password()));
        if let Some(password) = self.tools.database_url.password() {
            cmd = cmd.env("PGPASSWORD", password);
        }
        cmd
    }
}

fn reload(conn: &rusqlite::Connection, id: &str) -> Result<BackupJob> {
    backup_job::find_by_id(conn, id)?.ok_or_else(|| BackupError::NotFound(format!("Backup job {id} not found")))
}

pub(crate) fn tool_error(tool: &str, e: ProcessError) -> BackupError {
    match e {
        ProcessError::NotFound(_) => BackupError::ToolUnavailable(format!(
            "{tool} was not found in PATH or known installation directories"
        )),
        ProcessError::Timeout(t) => BackupError::Timeout(t),
        ProcessError::Io(e) => BackupError::Io(e),
    }
}

/// File extension for the dump format chosen by the policy.
pub fn extension(config: &BackupConfiguration) -> &'static str {
    if config.compress {
        "dump"
    } else {
        "tar"
    }
}

/// Claim `{dir}/{stem}.{ext}` by creating it exclusively, or `{stem}-{suffix}.{ext}`
/// when another run already holds that name.
fn reserve_output(dir: &Path, stem: &str, suffix: &str, ext: &str) -> std::io::Result<PathBuf> {
    for candidate in [dir.join(format!("{stem}.{ext}")), dir.join(format!("{stem}-{suffix}.{ext}"))] {
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("{} already holds a backup named {stem}-{suffix}.{ext}", dir.display()),
    ))
}

pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars().flat_map(|c| c.to_lowercase()) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug: String = slug.trim_matches('-').chars().take(60).collect();
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "backup".into()
    } else {
        slug
    }
}
