use crate::services::trigger::TickOutcome;
use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Every minute, at second zero.
pub const TICK_CRON: &str = "0 * * * * *";
pub const WATCHDOG_CRON: &str = "0 */15 * * * *";

/// Periodic driver owned by the composition root.
///
/// Ticks the trigger once a minute, runs the watchdog and keeps the
/// statistics snapshot warm. The jobs themselves stay short: a due backup is
/// handed to a worker task by [`crate::services::trigger::Trigger::tick`].
pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl BackupScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn init_schedules(&self) -> anyhow::Result<()> {
        let state = self.state.clone();
        let tick = Job::new_async(TICK_CRON, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                let now = chrono::Local::now().naive_local();
                match state.trigger.tick(now).await {
                    Ok(TickOutcome::Dispatched(_)) => {}
                    Ok(TickOutcome::NotDue(reason)) => tracing::trace!(%reason, "Backup not due"),
                    Ok(outcome) => tracing::debug!(?outcome, "Tick skipped"),
                    Err(e) => tracing::error!(error = %e, "Scheduler tick failed"),
                }
            })
        })?;

        let state = self.state.clone();
        let watchdog = Job::new_async(WATCHDOG_CRON, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                if let Err(e) = state.watchdog.sweep().await {
                    tracing::error!(error = %e, "Watchdog sweep failed");
                }
            })
        })?;

        let state = self.state.clone();
        let refresh = self.state.config.stats_refresh;
        let stats = Job::new_repeated_async(refresh, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                if let Err(e) = state.statistics.refresh().await {
                    tracing::warn!(error = %e, "Statistics refresh failed");
                }
            })
        })?;

        let scheduler = self.scheduler.lock().await;
        scheduler.add(tick).await?;
        scheduler.add(watchdog).await?;
        scheduler.add(stats).await?;

        tracing::info!(
            tick = TICK_CRON,
            watchdog = WATCHDOG_CRON,
            stats_refresh_secs = refresh.as_secs(),
            "Backup schedules initialized"
        );
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
