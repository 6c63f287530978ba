use crate::config::AppConfig;
use crate::db::{self, with_conn, DbPool};
use crate::error::{BackupError, Result};
use crate::models::backup_job::{self, BackupJob};
use crate::models::restore_job::{self, RestoreJob};
use crate::services::config_store::ConfigStore;
use crate::services::diagnostics::{DiagnosticsReport, DiagnosticsService};
use crate::services::executor::{BackupExecutor, BackupRequest};
use crate::services::notify::{LogNotifier, Notifier};
use crate::services::process::{ProcessRunner, SystemProcessRunner};
use crate::services::restore::RestoreOrchestrator;
use crate::services::retention::RetentionManager;
use crate::services::statistics::StatisticsService;
use crate::services::trigger::Trigger;
use crate::services::watchdog::Watchdog;
use std::path::PathBuf;
use std::sync::Arc;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub config_store: ConfigStore,
    pub diagnostics: DiagnosticsService,
    pub executor: BackupExecutor,
    pub trigger: Trigger,
    pub retention: RetentionManager,
    pub restore: RestoreOrchestrator,
    pub statistics: StatisticsService,
    pub watchdog: Watchdog,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig, runner: Arc<dyn ProcessRunner>, notifier: Arc<dyn Notifier>) -> Self {
        let config_store = ConfigStore::new(db.clone());
        let executor = BackupExecutor::new(
            db.clone(),
            config_store.clone(),
            runner.clone(),
            notifier,
            config.tools.clone(),
        );
        let retention = RetentionManager::new(db.clone(), config_store.clone());
        let trigger = Trigger::new(db.clone(), config_store.clone(), executor.clone(), retention.clone());

        Self {
            diagnostics: DiagnosticsService::new(runner.clone(), config.tools.clone()),
            restore: RestoreOrchestrator::new(db.clone(), runner, config.tools.clone()),
            statistics: StatisticsService::new(db.clone(), config.stats_refresh),
            watchdog: Watchdog::new(db.clone(), config.stuck_job_ceiling),
            config_store,
            executor,
            trigger,
            retention,
            db,
            config,
        }
    }

    /// Open the job store, apply the schema and wire real processes.
    pub async fn open(config: AppConfig) -> Result<Self> {
        let store_path = config.store_path.clone();
        let pool = tokio::task::spawn_blocking(move || {
            let pool = db::create_pool(&store_path)?;
            db::migrate::migrate(&pool)?;
            Ok::<_, BackupError>(pool)
        })
        .await??;
        tracing::info!(store = %config.store_path.display(), database = %config.tools.database_url, "Backup store opened");

        Ok(Self::new(pool, config, Arc::new(SystemProcessRunner), Arc::new(LogNotifier)))
    }

    /// The active policy's backup directory.
    pub async fn backup_dir(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.config_store.get().await?.local_path))
    }

    pub async fn diagnose(&self) -> Result<DiagnosticsReport> {
        let dir = self.backup_dir().await?;
        Ok(self.diagnostics.report(&dir).await)
    }

    /// Start a user-requested backup, refusing when preflight fails unless forced.
    pub async fn run_manual(&self, request: BackupRequest, force: bool) -> Result<BackupJob> {
        let report = self.diagnose().await?;
        if let Some(reason) = report.first_failure() {
            if !force {
                return Err(BackupError::NotReady(reason.to_string()));
            }
            tracing::warn!(reason, "Preflight failed; running anyway because the run was forced");
        }
        self.executor.run(request).await
    }

    pub async fn list_backups(&self, include_deleted: bool) -> Result<Vec<BackupJob>> {
        with_conn(&self.db, move |conn| backup_job::find_all(conn, include_deleted)).await
    }

    pub async fn list_restores(&self, backup_job_id: Option<String>) -> Result<Vec<RestoreJob>> {
        with_conn(&self.db, move |conn| restore_job::find_all(conn, backup_job_id.as_deref())).await
    }

    pub async fn delete_backup(&self, id: &str) -> Result<BackupJob> {
        self.retention.delete(id).await
    }

    /// Checkpoint the WAL so the store file is self-contained.
    pub fn close(&self) {
        db::connection::close_pool(&self.db);
    }
}
