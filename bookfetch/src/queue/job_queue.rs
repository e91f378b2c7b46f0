//! Durable job queue.
//!
//! Every job gets a database row before the engine sees it. Engine lifecycle
//! events are reconciled back into that row by a single reconcile loop, so
//! the row is the source of truth for status, attempts and results.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::engine::{EngineCounts, EngineEvent, EngineJobOptions, EngineJobSnapshot, QueueEngine};
use super::payload::{
    AudiobookRef, JOB_ID_KEY, JobPayload, MonitorTarget, SearchResultRef, job_id_of,
    scheduled_job_id_of,
};
use crate::database::models::{JobDbModel, JobStatus, JobType};
use crate::database::repositories::{JobRepository, RequestRepository};
use crate::notification::{NotificationEvent, Notifier, notify_detached};
use crate::{Error, Result};

/// Prefix of repeatable registration ids.
pub const REPEAT_ID_PREFIX: &str = "scheduled-";

/// Written on the row when a job is cancelled.
pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

/// Default event channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Deterministic repeatable id for a scheduled job.
pub fn repeat_id(scheduled_job_id: &str) -> String {
    format!("{REPEAT_ID_PREFIX}{scheduled_job_id}")
}

/// Events broadcast by the job queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A durable row changed status.
    JobUpdated { job_id: String, status: JobStatus },
    /// A cron-fired run got its durable row.
    ScheduledRunStarted {
        scheduled_job_id: String,
        job_id: String,
    },
}

/// Configuration for the job queue.
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Attempts per job before it is failed for good.
    pub max_attempts: u32,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

pub struct JobQueue {
    jobs: Arc<dyn JobRepository>,
    requests: Arc<dyn RequestRepository>,
    engine: Arc<dyn QueueEngine>,
    notifier: Arc<dyn Notifier>,
    events: broadcast::Sender<QueueEvent>,
    config: JobQueueConfig,
}

impl JobQueue {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        requests: Arc<dyn RequestRepository>,
        engine: Arc<dyn QueueEngine>,
        notifier: Arc<dyn Notifier>,
        config: JobQueueConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            jobs,
            requests,
            engine,
            notifier,
            events,
            config,
        }
    }

    pub async fn add_search_job(&self, request_id: &str, audiobook: AudiobookRef) -> Result<String> {
        self.enqueue(
            JobPayload::SearchIndexers {
                request_id: request_id.to_string(),
                audiobook,
            },
            Duration::ZERO,
        )
        .await
    }

    pub async fn add_download_job(
        &self,
        request_id: &str,
        audiobook_id: &str,
        torrent: SearchResultRef,
    ) -> Result<String> {
        self.enqueue(
            JobPayload::DownloadTorrent {
                request_id: request_id.to_string(),
                audiobook_id: audiobook_id.to_string(),
                torrent,
            },
            Duration::ZERO,
        )
        .await
    }

    pub async fn add_monitor_job(&self, target: MonitorTarget, delay: Duration) -> Result<String> {
        self.enqueue(JobPayload::MonitorDownload(target), delay).await
    }

    pub async fn add_organize_job(
        &self,
        request_id: &str,
        audiobook_id: &str,
        download_path: &str,
    ) -> Result<String> {
        self.enqueue(
            JobPayload::OrganizeFiles {
                request_id: request_id.to_string(),
                audiobook_id: audiobook_id.to_string(),
                download_path: download_path.to_string(),
            },
            Duration::ZERO,
        )
        .await
    }

    /// One-off run of a scheduled job type.
    pub async fn add_scheduled_job(
        &self,
        job_type: JobType,
        scheduled_job_id: Option<&str>,
    ) -> Result<String> {
        let payload = JobPayload::scheduled(job_type, scheduled_job_id.map(str::to_string))?;
        self.enqueue(payload, Duration::ZERO).await
    }

    /// Row first, then engine, then patch the engine handle onto the row.
    async fn enqueue(&self, payload: JobPayload, delay: Duration) -> Result<String> {
        let job_type = payload.job_type();
        let job = JobDbModel::new(
            job_type,
            serde_json::to_string(&payload)?,
            self.config.max_attempts,
        )
        .with_request_id(payload.request_id().map(str::to_string));
        self.jobs.create_job(&job).await?;

        let options = EngineJobOptions {
            priority: job_type.priority(),
            attempts: self.config.max_attempts,
            delay,
        };
        let data = payload.to_engine_value(&job.id)?;

        let engine_job_id = match self.engine.add(job_type.as_str(), data, options).await {
            Ok(id) => id,
            Err(e) => {
                self.mark_failed(job, &format!("Failed to enqueue: {e}")).await;
                return Err(e);
            }
        };
        self.jobs.set_engine_job_id(&job.id, &engine_job_id).await?;

        debug!(job_id = %job.id, %engine_job_id, %job_type, "Job enqueued");
        Ok(job.id)
    }

    async fn mark_failed(&self, mut job: JobDbModel, message: &str) {
        job.status = JobStatus::Failed.to_string();
        job.error_message = Some(message.to_string());
        job.completed_at = Some(Utc::now().to_rfc3339());
        if let Err(e) = self.jobs.update_job(&job).await {
            error!(job_id = %job.id, error = %e, "Failed to mark job failed");
        }
    }

    /// Register the cron repeatable for a scheduled job.
    pub async fn add_repeatable(
        &self,
        scheduled_job_id: &str,
        job_type: JobType,
        cron: &str,
    ) -> Result<()> {
        let payload = JobPayload::scheduled(job_type, Some(scheduled_job_id.to_string()))?;
        let options = EngineJobOptions {
            priority: job_type.priority(),
            attempts: self.config.max_attempts,
            delay: Duration::ZERO,
        };
        self.engine
            .add_repeatable(
                &repeat_id(scheduled_job_id),
                job_type.as_str(),
                payload.to_value()?,
                cron,
                options,
            )
            .await
    }

    pub async fn remove_repeatable(&self, scheduled_job_id: &str) -> Result<bool> {
        self.engine
            .remove_repeatable(&repeat_id(scheduled_job_id))
            .await
    }

    /// Re-run a failed or stuck job from scratch.
    pub async fn retry_job(&self, job_id: &str) -> Result<()> {
        let mut job = self
            .jobs
            .find_job(job_id)
            .await?
            .ok_or_else(|| Error::not_found("Job", job_id))?;

        match job.status() {
            Some(JobStatus::Failed | JobStatus::Stuck) => {}
            other => {
                return Err(Error::InvalidStateTransition {
                    from: other.map_or_else(|| job.status.clone(), |s| s.to_string()),
                    to: JobStatus::Pending.to_string(),
                });
            }
        }

        let previous = job.clone();
        job.status = JobStatus::Pending.to_string();
        job.attempts = 0;
        job.error_message = None;
        job.stack_trace = None;
        job.completed_at = None;
        self.jobs.update_job(&job).await?;

        let retried = match job.engine_job_id.as_deref() {
            Some(engine_job_id) => match self.engine.retry(engine_job_id).await {
                Ok(retried) => retried,
                Err(e) => {
                    if let Err(restore) = self.jobs.update_job(&previous).await {
                        error!(%job_id, error = %restore, "Failed to restore job after retry error");
                    }
                    return Err(e);
                }
            },
            None => false,
        };

        if !retried {
            debug!(%job_id, "Engine no longer holds the job, resubmitting");
            let engine_job_id = self.resubmit(&job).await?;
            self.jobs.set_engine_job_id(&job.id, &engine_job_id).await?;
        }

        info!(%job_id, "Job retried");
        let _ = self.events.send(QueueEvent::JobUpdated {
            job_id: job.id,
            status: JobStatus::Pending,
        });
        Ok(())
    }

    async fn resubmit(&self, job: &JobDbModel) -> Result<String> {
        let job_type = job
            .kind()
            .ok_or_else(|| Error::validation(format!("Unknown job type: {}", job.job_type)))?;
        let mut data: Value = serde_json::from_str(&job.payload)?;
        if let Value::Object(map) = &mut data {
            map.insert(JOB_ID_KEY.to_string(), Value::String(job.id.clone()));
        }
        let options = EngineJobOptions {
            priority: job.priority as i32,
            attempts: job.max_attempts.max(1) as u32,
            delay: Duration::ZERO,
        };
        self.engine.add(job_type.as_str(), data, options).await
    }

    /// Remove a job from the engine and mark its row failed.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let mut job = self
            .jobs
            .find_job(job_id)
            .await?
            .ok_or_else(|| Error::not_found("Job", job_id))?;

        if let Some(status) = job.status()
            && status.is_terminal()
        {
            return Err(Error::InvalidStateTransition {
                from: status.to_string(),
                to: "cancelled".to_string(),
            });
        }

        if let Some(engine_job_id) = job.engine_job_id.as_deref() {
            self.engine.remove(engine_job_id).await?;
        }

        job.status = JobStatus::Failed.to_string();
        job.error_message = Some(CANCELLED_MESSAGE.to_string());
        job.completed_at = Some(Utc::now().to_rfc3339());
        self.jobs.update_job(&job).await?;

        info!(%job_id, "Job cancelled");
        let _ = self.events.send(QueueEvent::JobUpdated {
            job_id: job.id,
            status: JobStatus::Failed,
        });
        Ok(())
    }

    pub async fn pause(&self) {
        self.engine.pause().await;
    }

    pub async fn resume(&self) {
        self.engine.resume().await;
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobDbModel>> {
        self.jobs.find_job(job_id).await
    }

    pub async fn get_stats(&self) -> EngineCounts {
        self.engine.counts().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Spawn the reconcile loop. Subscribe before the engine starts so no
    /// event is missed.
    pub fn start_reconciler(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.engine.subscribe();
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => queue.reconcile(&event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Reconciler lagged behind engine events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("Job reconciler stopped");
        })
    }

    /// Apply one engine event to its durable row. Never fails; errors are logged.
    pub async fn reconcile(&self, event: &EngineEvent) {
        if let Err(e) = self.try_reconcile(event).await {
            error!(
                event = event.kind(),
                engine_job_id = %event.job().id,
                error = %e,
                "Failed to reconcile engine event"
            );
        }
    }

    async fn try_reconcile(&self, event: &EngineEvent) -> Result<()> {
        let snapshot = event.job();
        let Some(mut job) = self.resolve_row(snapshot).await? else {
            warn!(
                engine_job_id = %snapshot.id,
                name = %snapshot.name,
                event = event.kind(),
                "No durable job for engine event"
            );
            return Ok(());
        };

        let previous = job.status();
        let now = Utc::now().to_rfc3339();
        let mut terminal_failure = None;

        match event {
            EngineEvent::Active { .. } => {
                job.status = JobStatus::Active.to_string();
                job.started_at = Some(now);
            }
            EngineEvent::Completed { result, .. } => {
                job.status = JobStatus::Completed.to_string();
                job.result = Some(serde_json::to_string(result)?);
                job.attempts = snapshot.attempts_made as i64;
                job.completed_at = Some(now);
            }
            EngineEvent::Failed {
                error, stack_trace, ..
            } => {
                job.error_message = Some(error.clone());
                job.stack_trace = stack_trace.clone();
                job.attempts = snapshot.attempts_made as i64;
                if snapshot.attempts_made >= snapshot.max_attempts {
                    job.status = JobStatus::Failed.to_string();
                    job.completed_at = Some(now);
                    if previous != Some(JobStatus::Failed) {
                        terminal_failure = Some(error.clone());
                    }
                } else {
                    job.status = JobStatus::Delayed.to_string();
                }
            }
            EngineEvent::Stalled { .. } => {
                job.status = JobStatus::Stuck.to_string();
            }
        }

        self.jobs.update_job(&job).await?;

        if let Some(status) = job.status() {
            let _ = self.events.send(QueueEvent::JobUpdated {
                job_id: job.id.clone(),
                status,
            });
        }

        if let Some(message) = terminal_failure {
            self.on_terminal_failure(&job, &message).await;
        }
        Ok(())
    }

    /// Find the durable row for an engine job, creating one for repeat-fired
    /// runs, which have none.
    async fn resolve_row(&self, snapshot: &EngineJobSnapshot) -> Result<Option<JobDbModel>> {
        if let Some(job) = self.jobs.find_by_engine_id(&snapshot.id).await? {
            return Ok(Some(job));
        }

        // The event can arrive before `enqueue` patched the handle in.
        if let Some(job_id) = job_id_of(&snapshot.data)
            && let Some(mut job) = self.jobs.find_job(job_id).await?
        {
            job.engine_job_id = Some(snapshot.id.clone());
            return Ok(Some(job));
        }

        let Some(repeat_id) = snapshot.repeat_id.as_deref() else {
            return Ok(None);
        };

        let job_type = JobType::parse(&snapshot.name)
            .ok_or_else(|| Error::validation(format!("Unknown job type: {}", snapshot.name)))?;
        let mut job = JobDbModel::new(
            job_type,
            serde_json::to_string(&snapshot.data)?,
            snapshot.max_attempts,
        );
        job.engine_job_id = Some(snapshot.id.clone());
        self.jobs.create_job(&job).await?;

        let scheduled_job_id = scheduled_job_id_of(&snapshot.data)
            .map(str::to_string)
            .or_else(|| repeat_id.strip_prefix(REPEAT_ID_PREFIX).map(str::to_string));
        if let Some(scheduled_job_id) = scheduled_job_id {
            let _ = self.events.send(QueueEvent::ScheduledRunStarted {
                scheduled_job_id,
                job_id: job.id.clone(),
            });
        }

        Ok(Some(job))
    }

    /// Compensating writes for a job that exhausted its attempts.
    async fn on_terminal_failure(&self, job: &JobDbModel, message: &str) {
        warn!(job_id = %job.id, job_type = %job.job_type, %message, "Job failed permanently");

        if job.kind() == Some(JobType::MonitorDownload) {
            match serde_json::from_str::<Value>(&job.payload)
                .map_err(Error::from)
                .and_then(|v| JobPayload::from_value(&v))
            {
                Ok(JobPayload::MonitorDownload(target)) => {
                    if let Err(e) = self
                        .requests
                        .fail_download(
                            &target.request_id,
                            Some(&target.download_history_id),
                            message,
                        )
                        .await
                    {
                        error!(
                            request_id = %target.request_id,
                            error = %e,
                            "Failed to cascade monitor failure"
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => error!(job_id = %job.id, error = %e, "Unreadable monitor payload"),
            }
        }

        if let Some(request_id) = &job.request_id {
            notify_detached(
                &self.notifier,
                NotificationEvent::RequestFailed {
                    request_id: request_id.clone(),
                    job_type: job.job_type.clone(),
                    message: message.to_string(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{DownloadHistoryDbModel, RequestDbModel};
    use crate::database::repositories::{SqlxJobRepository, SqlxRequestRepository};
    use crate::database::test_pool;
    use crate::queue::engine::{EngineConfig, InMemoryQueueEngine};
    use crate::testing::{EngineCall, RecordingEngine, RecordingNotifier};
    use serde_json::json;

    struct Harness {
        queue: Arc<JobQueue>,
        engine: Arc<RecordingEngine>,
        notifier: Arc<RecordingNotifier>,
        requests: Arc<SqlxRequestRepository>,
        pool: sqlx::SqlitePool,
    }

    async fn harness() -> Harness {
        let pool = test_pool().await;
        let engine = Arc::new(RecordingEngine::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let requests = Arc::new(SqlxRequestRepository::new(pool.clone()));
        let queue = Arc::new(JobQueue::new(
            Arc::new(SqlxJobRepository::new(pool.clone())),
            requests.clone(),
            engine.clone(),
            notifier.clone(),
            JobQueueConfig::default(),
        ));
        Harness {
            queue,
            engine,
            notifier,
            requests,
            pool,
        }
    }

    fn audiobook() -> AudiobookRef {
        AudiobookRef {
            id: "b1".into(),
            title: "Project Hail Mary".into(),
            author: "Andy Weir".into(),
            narrator: None,
            asin: None,
        }
    }

    fn snapshot_for(engine_id: &str, name: &str, data: Value, attempts_made: u32) -> EngineJobSnapshot {
        EngineJobSnapshot {
            id: engine_id.into(),
            name: name.into(),
            data,
            attempts_made,
            max_attempts: 3,
            repeat_id: None,
        }
    }

    async fn row(h: &Harness, id: &str) -> JobDbModel {
        h.queue.get_job(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_search_job_lifecycle() {
        let h = harness().await;
        let job_id = h.queue.add_search_job("r1", audiobook()).await.unwrap();

        let job = row(&h, &job_id).await;
        assert_eq!(job.status, "pending");
        assert_eq!(job.priority, 10);
        assert_eq!(job.request_id.as_deref(), Some("r1"));
        assert_eq!(job.engine_job_id.as_deref(), Some("1"));

        let (name, data, options) = h.engine.added().remove(0);
        assert_eq!(name, "search_indexers");
        assert_eq!(data["jobId"], json!(job_id));
        assert_eq!(data["requestId"], json!("r1"));
        assert_eq!(options.priority, 10);
        assert_eq!(options.attempts, 3);

        let snapshot = snapshot_for("1", "search_indexers", data, 0);
        h.queue
            .reconcile(&EngineEvent::Active {
                job: snapshot.clone(),
            })
            .await;
        let job = row(&h, &job_id).await;
        assert_eq!(job.status, "active");
        assert!(job.started_at.is_some());

        let result = json!({"resultsFound": 4, "selected": {"title": "PHM"}});
        h.queue
            .reconcile(&EngineEvent::Completed {
                job: snapshot,
                result: result.clone(),
            })
            .await;
        let job = row(&h, &job_id).await;
        assert_eq!(job.status, "completed");
        assert!(job.completed_at.is_some());
        let stored: Value = serde_json::from_str(job.result.as_deref().unwrap()).unwrap();
        assert_eq!(stored, result);
    }

    #[tokio::test]
    async fn test_active_before_handle_patch_resolves_by_job_id() {
        let h = harness().await;
        let job_id = h.queue.add_organize_job("r1", "b1", "/dl/book").await.unwrap();
        let (_, data, _) = h.engine.added().remove(0);

        // Different engine id than the stored one: lookup falls back to jobId.
        h.queue
            .reconcile(&EngineEvent::Active {
                job: snapshot_for("99", "organize_files", data, 0),
            })
            .await;
        let job = row(&h, &job_id).await;
        assert_eq!(job.status, "active");
        assert_eq!(job.engine_job_id.as_deref(), Some("99"));
    }

    #[tokio::test]
    async fn test_failed_attempts_delay_then_fail() {
        let h = harness().await;
        let job_id = h.queue.add_search_job("r1", audiobook()).await.unwrap();
        let (_, data, _) = h.engine.added().remove(0);

        h.queue
            .reconcile(&EngineEvent::Failed {
                job: snapshot_for("1", "search_indexers", data.clone(), 1),
                error: "indexer timeout".into(),
                stack_trace: Some("Other(\"indexer timeout\")".into()),
            })
            .await;
        let job = row(&h, &job_id).await;
        assert_eq!(job.status, "delayed");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error_message.as_deref(), Some("indexer timeout"));
        assert!(job.stack_trace.is_some());
        assert!(job.completed_at.is_none());

        h.queue
            .reconcile(&EngineEvent::Failed {
                job: snapshot_for("1", "search_indexers", data, 3),
                error: "indexer timeout".into(),
                stack_trace: None,
            })
            .await;
        let job = row(&h, &job_id).await;
        assert_eq!(job.status, "failed");
        assert_eq!(job.attempts, 3);
        assert!(job.completed_at.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn test_monitor_failure_cascades_once() {
        let h = harness().await;
        h.requests
            .create_request(&RequestDbModel::new("r1"))
            .await
            .unwrap();
        let history = DownloadHistoryDbModel::new("r1", "Book", "qbittorrent");
        h.requests.create_download_history(&history).await.unwrap();

        let job_id = h
            .queue
            .add_monitor_job(
                MonitorTarget {
                    request_id: "r1".into(),
                    audiobook_id: "b1".into(),
                    download_history_id: history.id.clone(),
                    download_client_id: "c1".into(),
                    client_item_id: "abc".into(),
                },
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        let (_, data, options) = h.engine.added().remove(0);
        assert_eq!(options.delay, Duration::from_secs(10));
        assert_eq!(options.priority, 5);

        let failed = EngineEvent::Failed {
            job: snapshot_for("1", "monitor_download", data, 3),
            error: "Download failed: tracker error".into(),
            stack_trace: None,
        };
        h.queue.reconcile(&failed).await;
        h.queue.reconcile(&failed).await;

        assert_eq!(row(&h, &job_id).await.status, "failed");
        let request = h.requests.get_request("r1").await.unwrap().unwrap();
        assert_eq!(request.status, "failed");
        assert_eq!(
            request.error_message.as_deref(),
            Some("Download failed: tracker error")
        );
        let history = h
            .requests
            .get_download_history(&history.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.download_status, "failed");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_marks_stuck() {
        let h = harness().await;
        let job_id = h.queue.add_download_job(
            "r1",
            "b1",
            SearchResultRef {
                title: "Book".into(),
                download_url: "magnet:?xt=urn:btih:abc".into(),
                protocol: download_clients::Protocol::Torrent,
                size: 0,
                indexer: None,
                info_hash: None,
            },
        )
        .await
        .unwrap();
        let (_, data, _) = h.engine.added().remove(0);

        h.queue
            .reconcile(&EngineEvent::Stalled {
                job: snapshot_for("1", "download_torrent", data, 0),
            })
            .await;
        assert_eq!(row(&h, &job_id).await.status, "stuck");
    }

    #[tokio::test]
    async fn test_retry_and_cancel_unknown_job() {
        let h = harness().await;
        let err = h.queue.retry_job("missing").await.unwrap_err();
        assert!(err.to_string().contains("Job not found"));
        let err = h.queue.cancel_job("missing").await.unwrap_err();
        assert!(err.to_string().contains("Job not found"));
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_retry_resets_row_and_delegates() {
        let h = harness().await;
        let job_id = h.queue.add_search_job("r1", audiobook()).await.unwrap();
        let (_, data, _) = h.engine.added().remove(0);
        h.queue
            .reconcile(&EngineEvent::Failed {
                job: snapshot_for("1", "search_indexers", data, 3),
                error: "boom".into(),
                stack_trace: Some("trace".into()),
            })
            .await;

        h.queue.retry_job(&job_id).await.unwrap();

        let job = row(&h, &job_id).await;
        assert_eq!(job.status, "pending");
        assert_eq!(job.attempts, 0);
        assert!(job.error_message.is_none());
        assert!(job.stack_trace.is_none());
        assert!(
            h.engine
                .calls()
                .contains(&EngineCall::Retry("1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_retry_resubmits_when_engine_forgot_job() {
        let h = harness().await;
        let job_id = h.queue.add_search_job("r1", audiobook()).await.unwrap();
        let (_, data, _) = h.engine.added().remove(0);
        h.queue
            .reconcile(&EngineEvent::Stalled {
                job: snapshot_for("1", "search_indexers", data, 0),
            })
            .await;
        h.engine.forget_jobs();

        h.queue.retry_job(&job_id).await.unwrap();

        let added = h.engine.added();
        assert_eq!(added.len(), 2);
        assert_eq!(added[1].1["jobId"], json!(job_id));
        assert_eq!(row(&h, &job_id).await.engine_job_id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_retry_rejects_job_that_is_not_failed() {
        let pool = test_pool().await;
        let engine = Arc::new(InMemoryQueueEngine::new(EngineConfig::default()));
        engine.pause().await;
        let queue = JobQueue::new(
            Arc::new(SqlxJobRepository::new(pool.clone())),
            Arc::new(SqlxRequestRepository::new(pool)),
            engine.clone(),
            Arc::new(RecordingNotifier::default()),
            JobQueueConfig::default(),
        );

        let job_id = queue.add_search_job("r1", audiobook()).await.unwrap();
        assert!(matches!(
            queue.retry_job(&job_id).await,
            Err(Error::InvalidStateTransition { .. })
        ));

        assert_eq!(engine.counts().await.waiting, 1);
        let job = queue.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, "pending");
    }

    #[tokio::test]
    async fn test_cancel_removes_and_marks_failed() {
        let h = harness().await;
        let job_id = h.queue.add_search_job("r1", audiobook()).await.unwrap();

        h.queue.cancel_job(&job_id).await.unwrap();

        let job = row(&h, &job_id).await;
        assert_eq!(job.status, "failed");
        assert_eq!(job.error_message.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(
            h.engine
                .calls()
                .contains(&EngineCall::Remove("1".to_string()))
        );

        // Already terminal.
        assert!(matches!(
            h.queue.cancel_job(&job_id).await,
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_repeat_fired_run_gets_row() {
        let h = harness().await;
        let mut events = h.queue.subscribe();

        let data = JobPayload::scheduled(JobType::AudibleRefresh, Some("s1".into()))
            .unwrap()
            .to_value()
            .unwrap();
        let mut snapshot = snapshot_for("repeat:scheduled-s1:1", "audible_refresh", data, 0);
        snapshot.repeat_id = Some(repeat_id("s1"));

        h.queue.reconcile(&EngineEvent::Active { job: snapshot }).await;

        let QueueEvent::ScheduledRunStarted {
            scheduled_job_id,
            job_id,
        } = events.recv().await.unwrap()
        else {
            panic!("expected ScheduledRunStarted first");
        };
        assert_eq!(scheduled_job_id, "s1");
        let job = row(&h, &job_id).await;
        assert_eq!(job.status, "active");
        assert_eq!(job.job_type, "audible_refresh");
        assert_eq!(job.priority, 1);
    }

    #[tokio::test]
    async fn test_unknown_engine_job_is_ignored() {
        let h = harness().await;
        h.queue
            .reconcile(&EngineEvent::Active {
                job: snapshot_for("42", "search_indexers", json!({}), 0),
            })
            .await;
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn test_repeatable_ids_and_scheduled_jobs() {
        let h = harness().await;
        h.queue
            .add_repeatable("s1", JobType::PlexLibraryScan, "0 */6 * * *")
            .await
            .unwrap();
        h.queue.remove_repeatable("s1").await.unwrap();
        assert_eq!(
            h.engine.calls(),
            vec![
                EngineCall::AddRepeatable {
                    repeat_id: "scheduled-s1".into(),
                    cron: "0 */6 * * *".into(),
                },
                EngineCall::RemoveRepeatable("scheduled-s1".into()),
            ]
        );

        assert!(
            h.queue
                .add_scheduled_job(JobType::OrganizeFiles, None)
                .await
                .is_err()
        );
    }
}
