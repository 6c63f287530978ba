use crate::error::Result;
use crate::models::backup_job::JobType;
use crate::models::{from_db_time, to_db_time, JobState};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastBackupSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub size_bytes: Option<i64>,
}

/// Derived view over live backup jobs; never consulted for job state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatistics {
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub last_backup: Option<LastBackupSummary>,
    pub average_duration_seconds: f64,
    pub total_storage_bytes: i64,
    pub computed_at: DateTime<Utc>,
}

pub fn compute(conn: &Connection) -> Result<BackupStatistics> {
    let (total, succeeded, failed, average, storage) = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(state = 'completed'), 0),
                COALESCE(SUM(state = 'failed'), 0),
                COALESCE(AVG(CASE WHEN state = 'completed' THEN duration_seconds END), 0.0),
                COALESCE(SUM(CASE WHEN state = 'completed' THEN size_bytes END), 0)
         FROM backup_jobs WHERE deleted_at IS NULL",
        [],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        },
    )?;

    let last_backup = conn
        .query_row(
            "SELECT id, name, job_type, state, started_at, size_bytes FROM backup_jobs
             WHERE deleted_at IS NULL ORDER BY started_at DESC LIMIT 1",
            [],
            |row| {
                let job_type: String = row.get(2)?;
                Ok(LastBackupSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    job_type: job_type.parse().map_err(|e: String| {
                        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
                    })?,
                    state: row.get(3)?,
                    started_at: from_db_time("started_at", row.get(4)?)?,
                    size_bytes: row.get(5)?,
                })
            },
        )
        .optional()?;

    Ok(BackupStatistics {
        total,
        succeeded,
        failed,
        last_backup,
        average_duration_seconds: average,
        total_storage_bytes: storage,
        computed_at: Utc::now(),
    })
}

pub fn save_snapshot(conn: &Connection, stats: &BackupStatistics) -> Result<()> {
    conn.execute(
        "INSERT INTO backup_statistics (id, snapshot, computed_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET snapshot = excluded.snapshot, computed_at = excluded.computed_at",
        params![serde_json::to_string(stats)?, to_db_time(&stats.computed_at)],
    )?;
    Ok(())
}

pub fn load_snapshot(conn: &Connection) -> Result<Option<BackupStatistics>> {
    let raw: Option<String> = conn
        .query_row("SELECT snapshot FROM backup_statistics WHERE id = 1", [], |row| row.get(0))
        .optional()?;
    Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
}
