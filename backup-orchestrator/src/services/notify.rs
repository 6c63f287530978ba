use crate::models::backup_config::BackupConfiguration;
use crate::models::backup_job::BackupJob;
use crate::models::JobState;
use async_trait::async_trait;
use std::sync::Arc;

/// Delivers backup outcome notices to operators.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipients: &[String], job: &BackupJob) -> anyhow::Result<()>;
}

/// Writes notices to the log instead of sending them anywhere.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipients: &[String], job: &BackupJob) -> anyhow::Result<()> {
        tracing::info!(
            job_id = %job.id,
            state = %job.state,
            recipients = recipients.len(),
            "Backup notification: {}",
            job.error_message.as_deref().unwrap_or("backup completed")
        );
        Ok(())
    }
}

/// Fire-and-forget dispatch honoring the policy's notify flags.
///
/// Returns the spawned task so tests can wait on it; callers normally drop it.
pub fn dispatch(
    notifier: &Arc<dyn Notifier>,
    config: &BackupConfiguration,
    job: &BackupJob,
) -> Option<tokio::task::JoinHandle<()>> {
    let wanted = match job.state {
        JobState::Completed => config.notify_on_success,
        JobState::Failed => config.notify_on_failure,
        _ => false,
    };
    if !wanted || config.notification_emails.is_empty() {
        return None;
    }

    let notifier = notifier.clone();
    let recipients: Vec<String> = config.notification_emails.iter().cloned().collect();
    let job = job.clone();
    Some(tokio::spawn(async move {
        if let Err(e) = notifier.notify(&recipients, &job).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to send backup notification");
        }
    }))
}
