use crate::db::{with_conn, DbPool};
use crate::error::{BackupError, Result};
use crate::models::backup_config::BackupConfiguration;
use crate::models::backup_job::{self, BackupJob};
use crate::services::config_store::ConfigStore;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionError {
    pub job_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub evicted: usize,
    pub errors: Vec<EvictionError>,
}

/// Evicts backups past the policy's age or count limit.
#[derive(Clone)]
pub struct RetentionManager {
    db: DbPool,
    config_store: ConfigStore,
}

impl RetentionManager {
    pub fn new(db: DbPool, config_store: ConfigStore) -> Self {
        Self { db, config_store }
    }

    /// Sweep against the active policy.
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        let config = self.config_store.get().await?;
        self.sweep(&config).await
    }

    /// Age pass, then count pass. Store failures abort; per-job failures are collected.
    pub async fn sweep(&self, config: &BackupConfiguration) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let cutoff = Utc::now() - Duration::days(i64::from(config.retention_days));
        let expired = with_conn(&self.db, move |conn| backup_job::find_expired(conn, &cutoff)).await?;
        for job in &expired {
            self.evict(job, "age", &mut report).await;
        }

        let completed = with_conn(&self.db, |conn| backup_job::find_live_completed_oldest_first(conn)).await?;
        let excess = completed.len().saturating_sub(config.max_backups as usize);
        for job in completed.iter().take(excess) {
            self.evict(job, "count", &mut report).await;
        }

        if report.evicted > 0 || !report.errors.is_empty() {
            tracing::info!(
                evicted = report.evicted,
                errors = report.errors.len(),
                retention_days = config.retention_days,
                max_backups = config.max_backups,
                "Retention sweep finished"
            );
        }
        Ok(report)
    }

    async fn evict(&self, job: &BackupJob, pass: &str, report: &mut SweepReport) {
        match self.remove_and_tombstone(job).await {
            Ok(true) => {
                report.evicted += 1;
                tracing::info!(job_id = %job.id, name = %job.name, pass, "Evicted backup");
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(job_id = %job.id, pass, error = %e, "Failed to evict backup");
                report.errors.push(EvictionError {
                    job_id: job.id.clone(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Returns false when the row was already tombstoned.
    async fn remove_and_tombstone(&self, job: &BackupJob) -> Result<bool> {
        if let Some(path) = &job.file_path {
            remove_artifact(Path::new(path)).await?;
        }
        let id = job.id.clone();
        with_conn(&self.db, move |conn| backup_job::tombstone(conn, &id, &Utc::now())).await
    }

    /// Explicitly delete one finished backup: file first, then the tombstone.
    pub async fn delete(&self, id: &str) -> Result<BackupJob> {
        let lookup = id.to_string();
        let job = with_conn(&self.db, move |conn| backup_job::find_by_id(conn, &lookup))
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("Backup job {id} not found")))?;
        if !job.state.is_terminal() {
            return Err(BackupError::InvalidState(format!(
                "Backup job {id} is {}; only finished backups can be deleted",
                job.state
            )));
        }

        if !self.remove_and_tombstone(&job).await? {
            return Err(BackupError::NotFound(format!("Backup job {id} not found")));
        }
        tracing::info!(job_id = %job.id, name = %job.name, "Backup deleted");

        let id = job.id.clone();
        with_conn(&self.db, move |conn| backup_job::find_by_id_including_deleted(conn, &id))
            .await?
            .ok_or_else(|| BackupError::NotFound(format!("Backup job {} not found", job.id)))
    }
}

/// Delete-if-exists; an already missing file is not an error.
pub(crate) async fn remove_artifact(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "Backup file already absent");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
