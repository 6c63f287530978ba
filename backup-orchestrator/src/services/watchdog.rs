use crate::db::{with_conn, DbPool};
use crate::error::{BackupError, Result};
use crate::models::backup_job::{BackupJob, JobType};
use crate::models::{backup_job, restore_job, JobState};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogReport {
    pub failed_backups: usize,
    pub failed_restores: usize,
}

/// Fails jobs that have been running longer than the ceiling, and at startup
/// fails scheduler jobs whose worker died with the previous process.
#[derive(Clone)]
pub struct Watchdog {
    db: DbPool,
    ceiling: Duration,
}

impl Watchdog {
    pub fn new(db: DbPool, ceiling: Duration) -> Self {
        Self { db, ceiling }
    }

    pub async fn sweep(&self) -> Result<WatchdogReport> {
        let ceiling = self.ceiling;
        let report = with_conn(&self.db, move |conn| {
            let now = Utc::now();
            let cutoff = now - chrono::Duration::from_std(ceiling).map_err(anyhow::Error::from)?;
            let message = format!(
                "Job exceeded the maximum run time of {} seconds and was marked failed",
                ceiling.as_secs()
            );
            let mut report = WatchdogReport::default();

            let stuck = backup_job::find_unfinished_before(conn, &cutoff)?;
            report.failed_backups = fail_backups(conn, &stuck, &message, &now)?;

            for job in restore_job::find_unfinished_before(conn, &cutoff)? {
                let result = match job.state {
                    JobState::Initiated => restore_job::mark_in_progress(conn, &job.id)
                        .and_then(|_| restore_job::fail(conn, &job.id, &message)),
                    _ => restore_job::fail(conn, &job.id, &message),
                };
                match result {
                    Ok(()) => {
                        tracing::warn!(restore_id = %job.id, backup_id = %job.backup_job_id, "Watchdog failed stuck restore");
                        report.failed_restores += 1;
                    }
                    Err(BackupError::InvalidState(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(report)
        })
        .await?;

        if report != WatchdogReport::default() {
            tracing::info!(
                failed_backups = report.failed_backups,
                failed_restores = report.failed_restores,
                "Watchdog sweep finished"
            );
        }
        Ok(report)
    }

    /// Fail AUTOMATIC and SCHEDULED backups that are still open when the
    /// scheduler starts. Only the serving process runs those, so no worker
    /// is left to finish them. Manual jobs and restores may belong to another
    /// `backupctl` invocation and are left to the ceiling.
    pub async fn recover_orphans(&self) -> Result<usize> {
        let recovered = with_conn(&self.db, |conn| {
            let now = Utc::now();
            let orphans = backup_job::find_unfinished_of_types(conn, &JobType::SCHEDULER_OWNED)?;
            fail_backups(
                conn,
                &orphans,
                "Job was interrupted when the scheduler stopped and was marked failed",
                &now,
            )
        })
        .await?;
        if recovered > 0 {
            tracing::warn!(recovered, "Failed automatic backups orphaned by the previous scheduler");
        }
        Ok(recovered)
    }
}

/// Moves each job to FAILED, passing through IN_PROGRESS when needed.
fn fail_backups(conn: &Connection, jobs: &[BackupJob], message: &str, now: &DateTime<Utc>) -> Result<usize> {
    let mut failed = 0;
    for job in jobs {
        let duration = (*now - job.started_at).num_seconds().max(0);
        let result = match job.state {
            JobState::Initiated => backup_job::mark_in_progress(conn, &job.id)
                .and_then(|_| backup_job::fail(conn, &job.id, message, now, duration)),
            _ => backup_job::fail(conn, &job.id, message, now, duration),
        };
        match result {
            Ok(()) => {
                tracing::warn!(job_id = %job.id, name = %job.name, started_at = %job.started_at, "Watchdog failed stuck backup");
                failed += 1;
            }
            // finalized concurrently
            Err(BackupError::InvalidState(_)) | Err(BackupError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(failed)
}
