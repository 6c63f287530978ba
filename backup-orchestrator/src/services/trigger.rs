//! Decides when an automatic backup is due and dispatches it.
//!
//! [`evaluate`] is a pure function of the policy and a local wall-clock
//! minute. [`Trigger::tick`] is what the periodic driver calls once a minute.

use crate::db::{with_conn, DbPool};
use crate::error::Result;
use crate::models::backup_config::{BackupConfiguration, Frequency};
use crate::models::backup_job::{self, JobType};
use crate::services::config_store::ConfigStore;
use crate::services::executor::{BackupExecutor, BackupRequest};
use crate::services::retention::RetentionManager;
use chrono::{Datelike, NaiveDateTime, Timelike};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDecision {
    pub should_run: bool,
    pub reason: String,
}

impl TriggerDecision {
    fn run(reason: impl Into<String>) -> Self {
        Self {
            should_run: true,
            reason: reason.into(),
        }
    }

    fn skip(reason: impl Into<String>) -> Self {
        Self {
            should_run: false,
            reason: reason.into(),
        }
    }
}

pub fn evaluate(config: &BackupConfiguration, now: NaiveDateTime) -> TriggerDecision {
    if !config.automatic_enabled {
        return TriggerDecision::skip("automatic backups are disabled");
    }

    let (hour, minute) = (now.hour(), now.minute());
    let at_time = hour == config.execution_time.hour() && minute == config.execution_time.minute();

    let due = match config.frequency {
        Frequency::Hourly => minute == 0,
        Frequency::Every6h => hour % 6 == 0 && minute == 0,
        Frequency::Every12h => (hour == 0 || hour == 12) && minute == 0,
        Frequency::Daily => at_time,
        Frequency::Weekly => at_time && now.weekday() == config.weekly_day,
        Frequency::Monthly => at_time && now.day() == 1,
    };

    if due {
        TriggerDecision::run(format!("{} schedule matches {}", config.frequency.as_str(), now.format("%Y-%m-%d %H:%M")))
    } else {
        TriggerDecision::skip(format!("{} schedule not due", config.frequency.as_str()))
    }
}

#[derive(Debug)]
pub enum TickOutcome {
    NotDue(String),
    /// A tick for a minute that already fired.
    DuplicateMinute,
    AlreadyRunning,
    Dispatched(JoinHandle<()>),
}

/// Clears the in-memory running flag when the worker ends, however it ends.
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct Trigger {
    db: DbPool,
    config_store: ConfigStore,
    executor: BackupExecutor,
    retention: RetentionManager,
    running: Arc<AtomicBool>,
    last_fired: Arc<Mutex<Option<NaiveDateTime>>>,
}

impl Trigger {
    pub fn new(db: DbPool, config_store: ConfigStore, executor: BackupExecutor, retention: RetentionManager) -> Self {
        Self {
            db,
            config_store,
            executor,
            retention,
            running: Arc::new(AtomicBool::new(false)),
            last_fired: Arc::new(Mutex::new(None)),
        }
    }

    /// Evaluate the active policy for `now` (local time) and hand a due run
    /// to a worker task. Returns without waiting for the backup.
    pub async fn tick(&self, now: NaiveDateTime) -> Result<TickOutcome> {
        let config = self.config_store.get().await?;
        let decision = evaluate(&config, now);
        if !decision.should_run {
            return Ok(TickOutcome::NotDue(decision.reason));
        }

        let minute = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        if self.last_fired_at() == Some(minute) {
            return Ok(TickOutcome::DuplicateMinute);
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Skipping automatic backup: previous run still in progress");
            return Ok(TickOutcome::AlreadyRunning);
        }
        let guard = RunGuard(self.running.clone());

        let in_progress = with_conn(&self.db, |conn| {
            backup_job::find_in_progress_of_types(conn, &JobType::SCHEDULER_OWNED)
        })
        .await?;
        if let Some(job) = in_progress.first() {
            tracing::warn!(job_id = %job.id, "Skipping automatic backup: job already in progress");
            return Ok(TickOutcome::AlreadyRunning);
        }

        if let Ok(mut last) = self.last_fired.lock() {
            *last = Some(minute);
        }
        tracing::info!(reason = %decision.reason, "Dispatching automatic backup");

        let executor = self.executor.clone();
        let retention = self.retention.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            match executor.run(BackupRequest::automatic(minute)).await {
                Ok(job) => {
                    tracing::info!(job_id = %job.id, "Automatic backup finished");
                    if let Err(e) = retention.sweep_now().await {
                        tracing::warn!(error = %e, "Retention sweep after automatic backup failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Automatic backup failed"),
            }
        });
        Ok(TickOutcome::Dispatched(handle))
    }

    /// True while an automatic backup dispatched by this trigger is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn last_fired_at(&self) -> Option<NaiveDateTime> {
        self.last_fired.lock().ok().and_then(|last| *last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backup_config::ExecutionTime;
    use crate::models::JobState;
    use crate::services::executor::tests::harness;
    use crate::services::process::fake::FakeRunner;
    use chrono::{NaiveDate, Weekday};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, min, 0).unwrap()
    }

    fn policy(frequency: Frequency, hour: u32, minute: u32) -> BackupConfiguration {
        BackupConfiguration {
            frequency,
            execution_time: ExecutionTime::new(hour, minute).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_daily_matches_only_execution_minute() {
        let config = policy(Frequency::Daily, 2, 0);
        let day = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let mut due = Vec::new();
        for minute_of_day in 0..24 * 60 {
            let now = day.and_hms_opt(minute_of_day / 60, minute_of_day % 60, 0).unwrap();
            if evaluate(&config, now).should_run {
                due.push(now);
            }
        }
        assert_eq!(due, vec![at(2026, 3, 10, 2, 0)]);
    }

    #[test]
    fn test_disabled_never_runs() {
        let mut config = policy(Frequency::Hourly, 0, 0);
        config.automatic_enabled = false;
        let decision = evaluate(&config, at(2026, 3, 10, 5, 0));
        assert!(!decision.should_run);
        assert_eq!(decision.reason, "automatic backups are disabled");
    }

    #[test]
    fn test_interval_frequencies() {
        let hourly = policy(Frequency::Hourly, 2, 0);
        assert!(evaluate(&hourly, at(2026, 3, 10, 17, 0)).should_run);
        assert!(!evaluate(&hourly, at(2026, 3, 10, 17, 1)).should_run);

        let six = policy(Frequency::Every6h, 2, 0);
        assert!(evaluate(&six, at(2026, 3, 10, 0, 0)).should_run);
        assert!(evaluate(&six, at(2026, 3, 10, 18, 0)).should_run);
        assert!(!evaluate(&six, at(2026, 3, 10, 2, 0)).should_run);

        let twelve = policy(Frequency::Every12h, 2, 0);
        assert!(evaluate(&twelve, at(2026, 3, 10, 12, 0)).should_run);
        assert!(!evaluate(&twelve, at(2026, 3, 10, 6, 0)).should_run);
        assert!(!evaluate(&twelve, at(2026, 3, 10, 12, 30)).should_run);
    }

    #[test]
    fn test_weekly_and_monthly() {
        let mut weekly = policy(Frequency::Weekly, 3, 30);
        // 2026-03-15 is a Sunday
        assert!(evaluate(&weekly, at(2026, 3, 15, 3, 30)).should_run);
        assert!(!evaluate(&weekly, at(2026, 3, 16, 3, 30)).should_run);
        weekly.weekly_day = Weekday::Mon;
        assert!(evaluate(&weekly, at(2026, 3, 16, 3, 30)).should_run);

        let monthly = policy(Frequency::Monthly, 1, 15);
        assert!(evaluate(&monthly, at(2026, 4, 1, 1, 15)).should_run);
        assert!(!evaluate(&monthly, at(2026, 4, 2, 1, 15)).should_run);
        assert!(!evaluate(&monthly, at(2026, 4, 1, 1, 16)).should_run);
    }

    async fn trigger_for(h: &crate::services::executor::tests::Harness) -> Trigger {
        let retention = RetentionManager::new(h.pool.clone(), h.config_store.clone());
        Trigger::new(h.pool.clone(), h.config_store.clone(), h.executor.clone(), retention)
    }

    #[tokio::test]
    async fn test_tick_dispatches_once_per_minute() {
        let h = harness(FakeRunner::succeeding()).await;
        let trigger = trigger_for(&h).await;

        let TickOutcome::Dispatched(handle) = trigger.tick(at(2026, 3, 10, 2, 0)).await.unwrap() else {
            panic!("expected a dispatch");
        };
        handle.await.unwrap();

        assert!(matches!(
            trigger.tick(at(2026, 3, 10, 2, 0)).await.unwrap(),
            TickOutcome::DuplicateMinute
        ));
        assert!(matches!(trigger.tick(at(2026, 3, 10, 2, 1)).await.unwrap(), TickOutcome::NotDue(_)));

        let conn = h.pool.get().unwrap();
        let jobs = backup_job::find_all(&conn, false).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::Automatic);
        assert_eq!(jobs[0].state, JobState::Completed);
        assert_eq!(jobs[0].name, "automatic-20260310-0200");
        assert_eq!(jobs[0].created_by, crate::models::Actor::System);
    }

    #[tokio::test]
    async fn test_tick_is_noop_while_automatic_job_in_progress() {
        let h = harness(FakeRunner::succeeding()).await;
        let trigger = trigger_for(&h).await;
        {
            let conn = h.pool.get().unwrap();
            let job = backup_job::create(
                &conn,
                &crate::models::backup_job::tests::new_job("earlier", JobType::Scheduled, chrono::Utc::now()),
            )
            .unwrap();
            backup_job::mark_in_progress(&conn, &job.id).unwrap();
        }

        assert!(matches!(
            trigger.tick(at(2026, 3, 10, 2, 0)).await.unwrap(),
            TickOutcome::AlreadyRunning
        ));
        assert!(h.runner.calls().is_empty());
        // the guard was released
        assert!(!trigger.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_manual_job_does_not_block_automatic_run() {
        let h = harness(FakeRunner::succeeding()).await;
        let trigger = trigger_for(&h).await;
        {
            let conn = h.pool.get().unwrap();
            let job = backup_job::create(
                &conn,
                &crate::models::backup_job::tests::new_job("by hand", JobType::Manual, chrono::Utc::now()),
            )
            .unwrap();
            backup_job::mark_in_progress(&conn, &job.id).unwrap();
        }
        assert!(matches!(
            trigger.tick(at(2026, 3, 10, 2, 0)).await.unwrap(),
            TickOutcome::Dispatched(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_automatic_run_is_recorded_and_skips_retention() {
        let h = harness(FakeRunner::failing(1, "connection refused")).await;
        let trigger = trigger_for(&h).await;
        let TickOutcome::Dispatched(handle) = trigger.tick(at(2026, 3, 10, 2, 0)).await.unwrap() else {
            panic!("expected a dispatch");
        };
        handle.await.unwrap();

        let conn = h.pool.get().unwrap();
        let jobs = backup_job::find_all(&conn, false).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Failed);
        assert!(!trigger.running.load(Ordering::SeqCst));
    }
}
