use crate::db::{with_conn, DbPool};
use crate::error::Result;
use crate::models::backup_config::{self, BackupConfiguration};

/// Holder of the single active backup policy.
///
/// Nothing is cached: every `get` reads the row, so the scheduler and the
/// retention sweep see an update on their next evaluation.
#[derive(Clone)]
pub struct ConfigStore {
    db: DbPool,
}

impl ConfigStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// The active policy, persisting the documented default on first use.
    pub async fn get(&self) -> Result<BackupConfiguration> {
        with_conn(&self.db, |conn| {
            if let Some(active) = backup_config::find_active(conn)? {
                return Ok(active);
            }
            let default = BackupConfiguration::default();
            if backup_config::insert_if_absent(conn, &default)? {
                tracing::info!(
                    frequency = default.frequency.as_str(),
                    time = %default.execution_time,
                    "[Config] Persisted default backup configuration"
                );
            }
            // an update may have landed between the read and the insert
            backup_config::find_active(conn)?
                .ok_or_else(|| anyhow::anyhow!("backup configuration row missing after insert").into())
        })
        .await
    }

    /// Validate and fully replace the active policy.
    pub async fn update(&self, config: BackupConfiguration) -> Result<BackupConfiguration> {
        config.validate()?;
        if config.store_remote {
            tracing::warn!("[Config] storeRemote is set but this node only keeps local copies");
        }
        with_conn(&self.db, move |conn| {
            backup_config::replace(conn, &config)?;
            tracing::info!(
                frequency = config.frequency.as_str(),
                time = %config.execution_time,
                retention_days = config.retention_days,
                max_backups = config.max_backups,
                "[Config] Backup configuration updated"
            );
            Ok(config)
        })
        .await
    }
}
