use crate::db::{with_conn, DbPool};
use crate::error::Result;
use crate::models::statistics::{self, BackupStatistics};
use chrono::Utc;
use std::time::Duration;

/// Cached backup statistics.
///
/// The snapshot is a derived view over the job table and is never used to
/// decide job state.
#[derive(Clone)]
pub struct StatisticsService {
    db: DbPool,
    max_age: Duration,
}

impl StatisticsService {
    pub fn new(db: DbPool, max_age: Duration) -> Self {
        Self { db, max_age }
    }

    /// Recompute from the job table and persist the snapshot.
    pub async fn refresh(&self) -> Result<BackupStatistics> {
        let stats = with_conn(&self.db, |conn| {
            let stats = statistics::compute(conn)?;
            statistics::save_snapshot(conn, &stats)?;
            Ok(stats)
        })
        .await?;
        tracing::debug!(total = stats.total, succeeded = stats.succeeded, failed = stats.failed, "Statistics refreshed");
        Ok(stats)
    }

    /// The cached snapshot while it is younger than the refresh interval.
    pub async fn current(&self) -> Result<BackupStatistics> {
        let cached = with_conn(&self.db, |conn| statistics::load_snapshot(conn)).await?;
        if let Some(stats) = cached {
            let age = (Utc::now() - stats.computed_at).to_std().unwrap_or_default();
            if age < self.max_age {
                return Ok(stats);
            }
        }
        self.refresh().await
    }
}
