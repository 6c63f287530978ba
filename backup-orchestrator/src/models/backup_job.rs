use crate::error::{BackupError, Result};
use crate::models::{from_db_time, to_db_time, Actor, JobState};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ── JobType ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Manual,
    Automatic,
    Scheduled,
    Emergency,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Manual => "manual",
            JobType::Automatic => "automatic",
            JobType::Scheduled => "scheduled",
            JobType::Emergency => "emergency",
        }
    }

    /// Types started by the scheduler rather than a person.
    pub const SCHEDULER_OWNED: [JobType; 2] = [JobType::Automatic, JobType::Scheduled];
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(JobType::Manual),
            "automatic" => Ok(JobType::Automatic),
            "scheduled" => Ok(JobType::Scheduled),
            "emergency" => Ok(JobType::Emergency),
            other => Err(format!("unknown backup type '{other}'")),
        }
    }
}

// ── BackupJob ──

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupJob {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub state: JobState,
    pub file_path: Option<String>,
    pub size_bytes: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub error_message: Option<String>,
    pub created_by: Actor,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl BackupJob {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

pub struct NewBackupJob {
    pub name: String,
    pub description: Option<String>,
    pub job_type: JobType,
    pub created_by: Actor,
    pub started_at: DateTime<Utc>,
}

/// Fields written when a run finishes successfully.
pub struct Completion {
    pub file_path: String,
    pub size_bytes: i64,
    pub duration_seconds: i64,
    pub finished_at: DateTime<Utc>,
}

fn row_to_job(row: &Row) -> rusqlite::Result<BackupJob> {
    let job_type: String = row.get("job_type")?;
    Ok(BackupJob {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        job_type: job_type.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        state: row.get("state")?,
        file_path: row.get("file_path")?,
        size_bytes: row.get("size_bytes")?,
        duration_seconds: row.get("duration_seconds")?,
        error_message: row.get("error_message")?,
        created_by: Actor::from_stored(row.get("created_by")?),
        started_at: from_db_time("started_at", row.get("started_at")?)?,
        finished_at: row
            .get::<_, Option<String>>("finished_at")?
            .map(|t| from_db_time("finished_at", t))
            .transpose()?,
        deleted_at: row
            .get::<_, Option<String>>("deleted_at")?
            .map(|t| from_db_time("deleted_at", t))
            .transpose()?,
    })
}

fn query_jobs(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<BackupJob>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, row_to_job)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn create(conn: &Connection, data: &NewBackupJob) -> Result<BackupJob> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO backup_jobs (id, name, description, job_type, state, created_by, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            data.name,
            data.description,
            data.job_type.as_str(),
            JobState::Initiated,
            data.created_by.as_str(),
            to_db_time(&data.started_at),
        ],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created backup job").into())
}

/// Look up a live (non-tombstoned) job.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<BackupJob>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_jobs WHERE id = ? AND deleted_at IS NULL")?;
    Ok(stmt.query_row(params![id], row_to_job).optional()?)
}

pub fn find_by_id_including_deleted(conn: &Connection, id: &str) -> Result<Option<BackupJob>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_jobs WHERE id = ?")?;
    Ok(stmt.query_row(params![id], row_to_job).optional()?)
}

pub fn find_all(conn: &Connection, include_deleted: bool) -> Result<Vec<BackupJob>> {
    if include_deleted {
        query_jobs(conn, "SELECT * FROM backup_jobs ORDER BY started_at DESC", [])
    } else {
        query_jobs(
            conn,
            "SELECT * FROM backup_jobs WHERE deleted_at IS NULL ORDER BY started_at DESC",
            [],
        )
    }
}

pub fn find_in_progress_of_types(conn: &Connection, types: &[JobType]) -> Result<Vec<BackupJob>> {
    let running = query_jobs(
        conn,
        "SELECT * FROM backup_jobs WHERE state = ? AND deleted_at IS NULL ORDER BY started_at",
        params![JobState::InProgress],
    )?;
    Ok(running.into_iter().filter(|j| types.contains(&j.job_type)).collect())
}

/// Terminal, live jobs started before `cutoff`, oldest first.
pub fn find_expired(conn: &Connection, cutoff: &DateTime<Utc>) -> Result<Vec<BackupJob>> {
    query_jobs(
        conn,
        "SELECT * FROM backup_jobs
         WHERE state IN ('completed', 'failed') AND deleted_at IS NULL AND started_at < ?
         ORDER BY started_at ASC",
        params![to_db_time(cutoff)],
    )
}

pub fn find_live_completed_oldest_first(conn: &Connection) -> Result<Vec<BackupJob>> {
    query_jobs(
        conn,
        "SELECT * FROM backup_jobs WHERE state = 'completed' AND deleted_at IS NULL ORDER BY started_at ASC",
        [],
    )
}

/// Live jobs that have not reached a terminal state and started before `cutoff`.
pub fn find_unfinished_before(conn: &Connection, cutoff: &DateTime<Utc>) -> Result<Vec<BackupJob>> {
    query_jobs(
        conn,
        "SELECT * FROM backup_jobs
         WHERE state IN ('initiated', 'in_progress') AND deleted_at IS NULL AND started_at < ?
         ORDER BY started_at ASC",
        params![to_db_time(cutoff)],
    )
}

/// Live INITIATED or IN_PROGRESS jobs of the given types, oldest first.
pub fn find_unfinished_of_types(conn: &Connection, types: &[JobType]) -> Result<Vec<BackupJob>> {
    let open = query_jobs(
        conn,
        "SELECT * FROM backup_jobs
         WHERE state IN ('initiated', 'in_progress') AND deleted_at IS NULL
         ORDER BY started_at ASC",
        [],
    )?;
    Ok(open.into_iter().filter(|j| types.contains(&j.job_type)).collect())
}

// ── State transitions ──

fn current_state(conn: &Connection, id: &str) -> Result<Option<JobState>> {
    let mut stmt = conn.prepare("SELECT state FROM backup_jobs WHERE id = ? AND deleted_at IS NULL")?;
    Ok(stmt.query_row(params![id], |row| row.get(0)).optional()?)
}

fn rejected(conn: &Connection, id: &str, from: JobState, to: JobState) -> BackupError {
    match current_state(conn, id) {
        Ok(Some(actual)) => BackupError::InvalidState(format!(
            "Backup job {id} is {actual}; cannot move from {from} to {to}"
        )),
        Ok(None) => BackupError::NotFound(format!("Backup job {id} not found")),
        Err(e) => e,
    }
}

/// Compare-and-set `(id, from) -> to` with extra column assignments.
fn compare_and_set(
    conn: &Connection,
    id: &str,
    from: JobState,
    to: JobState,
    sets: &str,
    extra: &[&dyn rusqlite::types::ToSql],
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(BackupError::InvalidState(format!("Illegal transition {from} -> {to}")));
    }
    let sql = format!(
        "UPDATE backup_jobs SET state = ?{sets} WHERE id = ? AND state = ? AND deleted_at IS NULL"
    );
    let mut params: Vec<&dyn rusqlite::types::ToSql> = Vec::with_capacity(extra.len() + 3);
    params.push(&to);
    params.extend_from_slice(extra);
    params.push(&id);
    params.push(&from);
    let changed = conn.execute(&sql, params.as_slice())?;
    if changed == 0 {
        return Err(rejected(conn, id, from, to));
    }
    Ok(())
}

pub fn mark_in_progress(conn: &Connection, id: &str) -> Result<()> {
    compare_and_set(conn, id, JobState::Initiated, JobState::InProgress, "", &[])
}

pub fn complete(conn: &Connection, id: &str, data: &Completion) -> Result<()> {
    let finished_at = to_db_time(&data.finished_at);
    compare_and_set(
        conn,
        id,
        JobState::InProgress,
        JobState::Completed,
        ", file_path = ?, size_bytes = ?, duration_seconds = ?, finished_at = ?, error_message = NULL",
        params![data.file_path, data.size_bytes, data.duration_seconds, finished_at],
    )
}

pub fn fail(conn: &Connection, id: &str, error_message: &str, finished_at: &DateTime<Utc>, duration_seconds: i64) -> Result<()> {
    let finished_at = to_db_time(finished_at);
    compare_and_set(
        conn,
        id,
        JobState::InProgress,
        JobState::Failed,
        ", file_path = NULL, size_bytes = NULL, error_message = ?, duration_seconds = ?, finished_at = ?",
        params![error_message, duration_seconds, finished_at],
    )
}

/// Soft-delete a terminal job. Returns false when it was already tombstoned.
pub fn tombstone(conn: &Connection, id: &str, at: &DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE backup_jobs SET deleted_at = ?
         WHERE id = ? AND deleted_at IS NULL AND state IN ('completed', 'failed')",
        params![to_db_time(at), id],
    )?;
    Ok(changed > 0)
}
