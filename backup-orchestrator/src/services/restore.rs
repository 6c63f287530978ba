//! Restore orchestration.
//!
//! A restore reads a COMPLETED backup's artifact and never writes to the
//! source backup row.

use crate::config::ToolSettings;
use crate::db::{with_conn, DbPool};
use crate::error::{BackupError, Result};
use crate::models::backup_job::{self, BackupJob};
use crate::models::restore_job::{self, RestoreJob, RestoreOptions};
use crate::models::{Actor, JobState};
use crate::services::diagnostics::locate_tool;
use crate::services::executor::{tool_error, MAX_ERROR_MESSAGE_CHARS};
use crate::services::process::{truncate_message, CommandSpec, ProcessRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone)]
pub struct RestoreOrchestrator {
    db: DbPool,
    runner: Arc<dyn ProcessRunner>,
    tools: ToolSettings,
}

impl RestoreOrchestrator {
    pub fn new(db: DbPool, runner: Arc<dyn ProcessRunner>, tools: ToolSettings) -> Self {
        Self { db, runner, tools }
    }

    pub async fn restore(&self, backup_job_id: &str, options: RestoreOptions, requested_by: Actor) -> Result<RestoreJob> {
        requested_by.validate().map_err(BackupError::Validation)?;
        if options.tables.iter().any(|t| t.trim().is_empty()) {
            return Err(BackupError::Validation("table names must not be empty".into()));
        }

        let lookup = backup_job_id.to_string();
        let backup = with_conn(&self.db, move |conn| backup_job::find_by_id(conn, &lookup))
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("Backup job {backup_job_id} not found")))?;
        if backup.state != JobState::Completed {
            return Err(BackupError::InvalidState(format!(
                "Backup job {} is {}; only completed backups can be restored",
                backup.id, backup.state
            )));
        }
        let file_path = backup
            .file_path
            .clone()
            .ok_or_else(|| BackupError::InvalidState(format!("Backup job {} has no file", backup.id)))?;

        let source_id = backup.id.clone();
        let opts = options.clone();
        let job = with_conn(&self.db, move |conn| {
            let job = restore_job::create(conn, &source_id, &opts, &requested_by)?;
            restore_job::mark_in_progress(conn, &job.id)?;
            Ok(job)
        })
        .await?;

        tracing::info!(
            restore_id = %job.id,
            backup_id = %backup.id,
            tables = options.tables.len(),
            clean = options.clean,
            "Restore started"
        );

        let outcome = self.invoke(&backup, Path::new(&file_path), &options).await;
        let restore_id = job.id.clone();
        let finished = match outcome {
            Ok(()) => {
                let id = restore_id.clone();
                match with_conn(&self.db, move |conn| restore_job::complete(conn, &id)).await {
                    Ok(()) => {
                        let finished = with_conn(&self.db, move |conn| reload(conn, &restore_id)).await?;
                        tracing::info!(restore_id = %finished.id, backup_id = %backup.id, "Restore completed");
                        finished
                    }
                    Err(e) => {
                        tracing::error!(restore_id = %job.id, error = %e, "Failed to record restore completion");
                        self.record_failure(restore_id, format!("Failed to record completion: {e}")).await?
                    }
                }
            }
            Err(e) => {
                tracing::error!(restore_id = %job.id, backup_id = %backup.id, error = %e, "Restore failed");
                self.record_failure(restore_id, e.to_string()).await?
            }
        };

        match finished.state {
            JobState::Completed => Ok(finished),
            _ => Err(BackupError::RestoreFailed(Box::new(finished))),
        }
    }

    async fn record_failure(&self, restore_id: String, message: String) -> Result<RestoreJob> {
        let message = truncate_message(&message, MAX_ERROR_MESSAGE_CHARS);
        with_conn(&self.db, move |conn| {
            restore_job::fail(conn, &restore_id, &message)?;
            reload(conn, &restore_id)
        })
        .await
    }

    async fn invoke(&self, backup: &BackupJob, file: &Path, options: &RestoreOptions) -> Result<()> {
        if tokio::fs::metadata(file).await.is_err() {
            return Err(BackupError::ToolExecution(format!(
                "Backup file {} for job {} no longer exists",
                file.display(),
                backup.id
            )));
        }

        let program = locate_tool(&self.tools.restore_tool).await;
        let command = self.restore_command(program, file, options);
        tracing::debug!(backup_id = %backup.id, command = %command.display(), "Invoking restore tool");

        let tool = &self.tools.restore_tool;
        let out = self
            .runner
            .run(&command, self.tools.restore_timeout)
            .await
            .map_err(|e| tool_error(tool, e))?;
        if !out.success() {
            return Err(BackupError::ToolExecution(format!(
                "{tool} exited with {}: {}",
                out.exit_code.map_or("a signal".to_string(), |c| format!("code {c}")),
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    fn restore_command(&self, program: PathBuf, file: &Path, options: &RestoreOptions) -> CommandSpec {
        let mut cmd = CommandSpec::new(program)
            .arg("--no-password")
            .arg(format!("--dbname={}", self.tools.database_url.without_password()));
        if options.clean {
            cmd = cmd.arg("--clean").arg("--if-exists");
        }
        for table in &options.tables {
            cmd = cmd.arg(format!("--table={}", table.trim()));
        }
        cmd = cmd.arg(file.as_os_str());
        if let Some(password) = self.tools.database_url.password() {
            cmd = cmd.env("PGPASSWORD", password);
        }
        cmd
    }
}

fn reload(conn: &rusqlite::Connection, id: &str) -> Result<RestoreJob> {
    restore_job::find_by_id(conn, id)?.ok_or_else(|| BackupError::NotFound(format!("Restore job {id} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backup_job::tests::{completed_job, new_job, test_pool};
    use crate::models::backup_job::JobType;
    use crate::services::executor::tests::tools;
    use crate::services::process::fake::{FakeRunner, Script};
    use chrono::Utc;

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: DbPool,
        runner: Arc<FakeRunner>,
        orchestrator: RestoreOrchestrator,
        backup: BackupJob,
        file: PathBuf,
    }

    fn fixture(runner: FakeRunner) -> Fixture {
        let (dir, pool) = test_pool();
        let file = dir.path().join("20260301-020000_nightly.dump");
        std::fs::write(&file, b"dump").unwrap();
        let backup = {
            let conn = pool.get().unwrap();
            completed_job(&conn, "nightly", Utc::now(), &file.to_string_lossy())
        };
        let runner = Arc::new(runner);
        let orchestrator = RestoreOrchestrator::new(pool.clone(), runner.clone(), tools());
        Fixture {
            _dir: dir,
            pool,
            runner,
            orchestrator,
            backup,
            file,
        }
    }

    #[tokio::test]
    async fn test_restore_invokes_tool_with_backup_file() {
        let f = fixture(FakeRunner::succeeding());
        let options = RestoreOptions {
            tables: vec!["clients".into(), "orders".into()],
            clean: true,
        };
        let job = f
            .orchestrator
            .restore(&f.backup.id, options.clone(), Actor::user("ops"))
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.backup_job_id, f.backup.id);
        assert_eq!(job.options, options);
        assert!(job.finished_at.is_some());

        let args = f.runner.args_of(0);
        assert_eq!(args.last().unwrap(), &f.file.to_string_lossy().to_string());
        assert!(args.contains(&"--clean".to_string()));
        assert!(args.contains(&"--if-exists".to_string()));
        assert!(args.contains(&"--table=clients".to_string()));
        assert!(args.contains(&"--table=orders".to_string()));
        assert!(args.iter().all(|a| !a.contains("hunter2")));

        let conn = f.pool.get().unwrap();
        let source = backup_job::find_by_id(&conn, &f.backup.id).unwrap().unwrap();
        assert_eq!(source.state, JobState::Completed);
        assert_eq!(source.file_path, f.backup.file_path);
    }

    #[tokio::test]
    async fn test_restore_refuses_unknown_and_unfinished_backups() {
        let f = fixture(FakeRunner::succeeding());
        let err = f.orchestrator.restore("nope", RestoreOptions::default(), Actor::user("ops")).await;
        assert!(matches!(err, Err(BackupError::NotFound(_))));

        let (initiated, running, failed) = {
            let conn = f.pool.get().unwrap();
            let now = Utc::now();
            let initiated = backup_job::create(&conn, &new_job("i", JobType::Manual, now)).unwrap();
            let running = backup_job::create(&conn, &new_job("r", JobType::Manual, now)).unwrap();
            backup_job::mark_in_progress(&conn, &running.id).unwrap();
            let failed = backup_job::create(&conn, &new_job("f", JobType::Manual, now)).unwrap();
            backup_job::mark_in_progress(&conn, &failed.id).unwrap();
            backup_job::fail(&conn, &failed.id, "exit code 1", &now, 0).unwrap();
            (initiated, running, failed)
        };
        for id in [&initiated.id, &running.id, &failed.id] {
            let err = f.orchestrator.restore(id, RestoreOptions::default(), Actor::user("ops")).await;
            assert!(matches!(err, Err(BackupError::InvalidState(_))), "{id}");
        }
        assert!(f.runner.calls().is_empty());

        let conn = f.pool.get().unwrap();
        assert!(restore_job::find_all(&conn, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_refuses_tombstoned_backup() {
        let f = fixture(FakeRunner::succeeding());
        {
            let conn = f.pool.get().unwrap();
            backup_job::tombstone(&conn, &f.backup.id, &Utc::now()).unwrap();
        }
        let err = f.orchestrator.restore(&f.backup.id, RestoreOptions::default(), Actor::user("ops")).await;
        assert!(matches!(err, Err(BackupError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_tool_failure_is_recorded() {
        let f = fixture(FakeRunner::failing(1, "pg_restore: error: could not connect"));
        let err = f
            .orchestrator
            .restore(&f.backup.id, RestoreOptions::default(), Actor::user("ops"))
            .await
            .unwrap_err();
        assert!(err.is_recorded());
        let BackupError::RestoreFailed(job) = err else { panic!("expected recorded failure") };
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error_message.unwrap().contains("could not connect"));
    }

    #[tokio::test]
    async fn test_unrecordable_completion_ends_failed() {
        let f = fixture(FakeRunner::succeeding());
        {
            let conn = f.pool.get().unwrap();
            conn.execute_batch(
                "CREATE TRIGGER refuse_restore_completion BEFORE UPDATE OF state ON restore_jobs
                 WHEN NEW.state = 'completed' BEGIN SELECT RAISE(ABORT, 'database is locked'); END;",
            )
            .unwrap();
        }
        let err = f
            .orchestrator
            .restore(&f.backup.id, RestoreOptions::default(), Actor::user("ops"))
            .await
            .unwrap_err();
        let BackupError::RestoreFailed(job) = err else { panic!("expected recorded failure") };
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error_message.unwrap().contains("database is locked"));

        let conn = f.pool.get().unwrap();
        let stored = restore_job::find_by_id(&conn, &job.id).unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_without_invoking_tool() {
        let f = fixture(FakeRunner::new(Script::Missing));
        std::fs::remove_file(&f.file).unwrap();
        let err = f
            .orchestrator
            .restore(&f.backup.id, RestoreOptions::default(), Actor::user("ops"))
            .await
            .unwrap_err();
        let BackupError::RestoreFailed(job) = err else { panic!("expected recorded failure") };
        assert!(job.error_message.unwrap().contains("no longer exists"));
        assert!(f.runner.calls().is_empty());
    }
}
