use crate::db::connection::DbPool;
use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_configuration (
  id INTEGER PRIMARY KEY CHECK(id = 1),
  automatic_enabled INTEGER NOT NULL,
  frequency TEXT NOT NULL CHECK(frequency IN ('hourly','every_6h','every_12h','daily','weekly','monthly')),
  execution_time TEXT NOT NULL,
  weekly_day INTEGER NOT NULL DEFAULT 0,
  retention_days INTEGER NOT NULL,
  max_backups INTEGER NOT NULL,
  store_local INTEGER NOT NULL,
  store_remote INTEGER NOT NULL,
  local_path TEXT NOT NULL,
  encrypt INTEGER NOT NULL,
  compress INTEGER NOT NULL,
  compression_level INTEGER NOT NULL,
  notify_on_success INTEGER NOT NULL,
  notify_on_failure INTEGER NOT NULL,
  notification_emails TEXT NOT NULL DEFAULT '[]',
  excluded_tables TEXT NOT NULL DEFAULT '[]',
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backup_jobs (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT,
  job_type TEXT NOT NULL CHECK(job_type IN ('manual','automatic','scheduled','emergency')),
  state TEXT NOT NULL DEFAULT 'initiated' CHECK(state IN ('initiated','in_progress','completed','failed')),
  file_path TEXT,
  size_bytes INTEGER,
  duration_seconds INTEGER,
  error_message TEXT,
  created_by TEXT NOT NULL,
  started_at TEXT NOT NULL,
  finished_at TEXT,
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS restore_jobs (
  id TEXT PRIMARY KEY,
  backup_job_id TEXT NOT NULL REFERENCES backup_jobs(id),
  state TEXT NOT NULL DEFAULT 'initiated' CHECK(state IN ('initiated','in_progress','completed','failed')),
  options TEXT NOT NULL DEFAULT '{}',
  created_by TEXT NOT NULL,
  started_at TEXT NOT NULL,
  finished_at TEXT,
  error_message TEXT
);

CREATE TABLE IF NOT EXISTS backup_statistics (
  id INTEGER PRIMARY KEY CHECK(id = 1),
  snapshot TEXT NOT NULL,
  computed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backup_jobs_started_at ON backup_jobs(started_at);
CREATE INDEX IF NOT EXISTS idx_backup_jobs_state ON backup_jobs(state);
CREATE INDEX IF NOT EXISTS idx_restore_jobs_backup ON restore_jobs(backup_job_id);
"#;

pub fn migrate(pool: &DbPool) -> Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
