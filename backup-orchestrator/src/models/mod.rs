pub mod actor;
pub mod backup_config;
pub mod backup_job;
pub mod job_state;
pub mod restore_job;
pub mod statistics;

pub use actor::Actor;
pub use job_state::JobState;

use chrono::{DateTime, Utc};

/// Timestamps are stored as RFC 3339 text with a fixed precision so that
/// lexical order in SQL matches chronological order.
pub(crate) fn to_db_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(column: &str, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, format!("{column}: {e}").into())
        })
}
