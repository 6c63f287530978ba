use crate::error::{BackupError, Result};
use crate::models::{from_db_time, to_db_time, Actor, JobState};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Options translated into restore tool arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOptions {
    /// Restrict the restore to these tables; empty means everything.
    #[serde(default)]
    pub tables: Vec<String>,
    /// Drop existing objects before recreating them.
    #[serde(default)]
    pub clean: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreJob {
    pub id: String,
    pub backup_job_id: String,
    pub state: JobState,
    pub options: RestoreOptions,
    pub created_by: Actor,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

fn row_to_restore(row: &Row) -> rusqlite::Result<RestoreJob> {
    let options: String = row.get("options")?;
    Ok(RestoreJob {
        id: row.get("id")?,
        backup_job_id: row.get("backup_job_id")?,
        state: row.get("state")?,
        options: serde_json::from_str(&options).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_by: Actor::from_stored(row.get("created_by")?),
        started_at: from_db_time("started_at", row.get("started_at")?)?,
        finished_at: row
            .get::<_, Option<String>>("finished_at")?
            .map(|t| from_db_time("finished_at", t))
            .transpose()?,
        error_message: row.get("error_message")?,
    })
}

pub fn create(conn: &Connection, backup_job_id: &str, options: &RestoreOptions, created_by: &Actor) -> Result<RestoreJob> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO restore_jobs (id, backup_job_id, state, options, created_by, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            backup_job_id,
            JobState::Initiated,
            serde_json::to_string(options)?,
            created_by.as_str(),
            to_db_time(&Utc::now()),
        ],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created restore job").into())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<RestoreJob>> {
    let mut stmt = conn.prepare("SELECT * FROM restore_jobs WHERE id = ?")?;
    Ok(stmt.query_row(params![id], row_to_restore).optional()?)
}

/// Restore jobs newest first, optionally for one backup.
pub fn find_all(conn: &Connection, backup_job_id: Option<&str>) -> Result<Vec<RestoreJob>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM restore_jobs WHERE (?1 IS NULL OR backup_job_id = ?1) ORDER BY started_at DESC",
    )?;
    let rows = stmt.query_map(params![backup_job_id], row_to_restore)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_unfinished_before(conn: &Connection, cutoff: &DateTime<Utc>) -> Result<Vec<RestoreJob>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM restore_jobs WHERE state IN ('initiated', 'in_progress') AND started_at < ? ORDER BY started_at",
    )?;
    let rows = stmt.query_map(params![to_db_time(cutoff)], row_to_restore)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn transition(conn: &Connection, id: &str, from: JobState, to: JobState, error_message: Option<&str>) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(BackupError::InvalidState(format!("Illegal transition {from} -> {to}")));
    }
    let finished_at = to.is_terminal().then(|| to_db_time(&Utc::now()));
    let changed = conn.execute(
        "UPDATE restore_jobs SET state = ?1, finished_at = ?2, error_message = ?3 WHERE id = ?4 AND state = ?5",
        params![to, finished_at, error_message, id, from],
    )?;
    if changed == 0 {
        return Err(BackupError::InvalidState(format!(
            "Restore job {id} is not {from}; cannot move to {to}"
        )));
    }
    Ok(())
}

pub fn mark_in_progress(conn: &Connection, id: &str) -> Result<()> {
    transition(conn, id, JobState::Initiated, JobState::InProgress, None)
}

pub fn complete(conn: &Connection, id: &str) -> Result<()> {
    transition(conn, id, JobState::InProgress, JobState::Completed, None)
}

pub fn fail(conn: &Connection, id: &str, error_message: &str) -> Result<()> {
    transition(conn, id, JobState::InProgress, JobState::Failed, Some(error_message))
}
