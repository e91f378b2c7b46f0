//! Scheduler service.
//!
//! Owns the recurring job definitions: seeds the defaults, keeps one engine
//! repeatable per enabled definition and catches up on runs missed while the
//! process was down.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cron_expr;
use crate::database::models::{JobType, ScheduledJobDbModel};
use crate::database::repositories::ScheduledJobRepository;
use crate::queue::{JobQueue, QueueEvent};
use crate::{Error, Result};

/// Definition seeded on first start when no row of its type exists.
#[derive(Debug, Clone, Copy)]
pub struct DefaultSchedule {
    pub job_type: JobType,
    pub name: &'static str,
    pub schedule: &'static str,
    pub enabled: bool,
}

pub const DEFAULT_SCHEDULES: &[DefaultSchedule] = &[
    DefaultSchedule {
        job_type: JobType::PlexLibraryScan,
        name: "Library Scan",
        schedule: "0 */6 * * *",
        enabled: true,
    },
    DefaultSchedule {
        job_type: JobType::PlexRecentlyAddedCheck,
        name: "Recently Added Check",
        schedule: "*/5 * * * *",
        enabled: true,
    },
    DefaultSchedule {
        job_type: JobType::AudibleRefresh,
        name: "Audible Data Refresh",
        schedule: "0 0 * * *",
        enabled: true,
    },
    DefaultSchedule {
        job_type: JobType::RetryMissingTorrents,
        name: "Retry Missing Torrents",
        schedule: "0 0 * * *",
        enabled: true,
    },
    DefaultSchedule {
        job_type: JobType::RetryFailedImports,
        name: "Retry Failed Imports",
        schedule: "0 */6 * * *",
        enabled: true,
    },
    DefaultSchedule {
        job_type: JobType::CleanupSeededTorrents,
        name: "Cleanup Seeded Torrents",
        schedule: "*/30 * * * *",
        enabled: true,
    },
    DefaultSchedule {
        job_type: JobType::MonitorRssFeeds,
        name: "Monitor RSS Feeds",
        schedule: "*/15 * * * *",
        enabled: false,
    },
];

/// Input for a new scheduled job.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduledJob {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub schedule: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub payload: Option<Value>,
}

fn default_enabled() -> bool {
    true
}

/// Partial update; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateScheduledJob {
    pub name: Option<String>,
    pub schedule: Option<String>,
    pub enabled: Option<bool>,
    pub payload: Option<Value>,
}

pub struct Scheduler {
    repo: Arc<dyn ScheduledJobRepository>,
    queue: Arc<JobQueue>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(repo: Arc<dyn ScheduledJobRepository>, queue: Arc<JobQueue>) -> Self {
        Self {
            repo,
            queue,
            listener: Mutex::new(None),
        }
    }

    /// Seed defaults, register repeatables for enabled rows, then run the
    /// overdue sweep.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let seeded = self.seed_defaults().await?;
        if seeded > 0 {
            info!(seeded, "Seeded default scheduled jobs");
        }

        self.spawn_listener(cancel);

        let jobs = self.repo.list_scheduled_jobs().await?;
        let mut registered = 0;
        for job in jobs.iter().filter(|j| j.enabled) {
            match self.register(job).await {
                Ok(()) => registered += 1,
                Err(e) => warn!(
                    scheduled_job_id = %job.id,
                    name = %job.name,
                    error = %e,
                    "Failed to register scheduled job"
                ),
            }
        }
        info!(registered, total = jobs.len(), "Scheduler started");

        let triggered = self.trigger_overdue_jobs().await?;
        if !triggered.is_empty() {
            info!(count = triggered.len(), "Triggered overdue scheduled jobs");
        }
        Ok(())
    }

    /// Wait for the run listener after its cancellation token fired.
    pub async fn stop(&self) {
        let handle = self.listener.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Scheduler listener ended abnormally");
        }
    }

    /// Create one row per default type that has none. Returns how many were added.
    pub async fn seed_defaults(&self) -> Result<usize> {
        let mut created = 0;
        for default in DEFAULT_SCHEDULES {
            if self
                .repo
                .find_by_type(default.job_type.as_str())
                .await?
                .is_some()
            {
                continue;
            }
            let job = ScheduledJobDbModel::new(
                default.name,
                default.job_type,
                default.schedule,
                default.enabled,
            );
            self.repo.create_scheduled_job(&job).await?;
            debug!(job_type = %default.job_type, "Seeded scheduled job");
            created += 1;
        }
        Ok(created)
    }

    fn spawn_listener(&self, cancel: CancellationToken) {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return;
        }

        let mut rx = self.queue.subscribe();
        let repo = Arc::clone(&self.repo);
        *listener = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(QueueEvent::ScheduledRunStarted { scheduled_job_id, job_id }) => {
                            let now = Utc::now().to_rfc3339();
                            if let Err(e) = repo.record_run(&scheduled_job_id, &now, &job_id).await {
                                error!(%scheduled_job_id, error = %e, "Failed to record scheduled run");
                            } else {
                                debug!(%scheduled_job_id, %job_id, "Recorded scheduled run");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Scheduler listener lagged behind queue events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }));
    }

    async fn register(&self, job: &ScheduledJobDbModel) -> Result<()> {
        let job_type = scheduled_type(&job.job_type)?;
        self.queue
            .add_repeatable(&job.id, job_type, &job.schedule)
            .await
    }

    pub async fn create_scheduled_job(&self, input: CreateScheduledJob) -> Result<ScheduledJobDbModel> {
        cron_expr::validate(&input.schedule)?;
        if !input.job_type.is_scheduled() {
            return Err(Error::validation(format!(
                "{} cannot be scheduled",
                input.job_type
            )));
        }

        let mut job =
            ScheduledJobDbModel::new(input.name, input.job_type, input.schedule, input.enabled);
        if let Some(payload) = input.payload {
            job.payload = serde_json::to_string(&payload)?;
        }
        self.repo.create_scheduled_job(&job).await?;

        if job.enabled {
            self.register(&job).await?;
        }
        info!(scheduled_job_id = %job.id, name = %job.name, schedule = %job.schedule, "Scheduled job created");
        Ok(job)
    }

    pub async fn update_scheduled_job(
        &self,
        id: &str,
        update: UpdateScheduledJob,
    ) -> Result<ScheduledJobDbModel> {
        let existing = self
            .repo
            .get_scheduled_job(id)
            .await?
            .ok_or_else(|| Error::not_found("Scheduled job", id))?;
        if let Some(schedule) = &update.schedule {
            cron_expr::validate(schedule)?;
        }

        let mut job = existing.clone();
        if let Some(name) = update.name {
            job.name = name;
        }
        if let Some(schedule) = update.schedule {
            job.schedule = schedule;
        }
        if let Some(enabled) = update.enabled {
            job.enabled = enabled;
        }
        if let Some(payload) = update.payload {
            job.payload = serde_json::to_string(&payload)?;
        }
        self.repo.update_scheduled_job(&job).await?;

        if existing.enabled {
            self.queue.remove_repeatable(id).await?;
        }
        if job.enabled {
            self.register(&job).await?;
        }

        info!(scheduled_job_id = %id, enabled = job.enabled, schedule = %job.schedule, "Scheduled job updated");
        Ok(job)
    }

    pub async fn delete_scheduled_job(&self, id: &str) -> Result<()> {
        let job = self
            .repo
            .get_scheduled_job(id)
            .await?
            .ok_or_else(|| Error::not_found("Scheduled job", id))?;

        if job.enabled {
            self.queue.remove_repeatable(id).await?;
        }
        self.repo.delete_scheduled_job(id).await?;
        info!(scheduled_job_id = %id, name = %job.name, "Scheduled job deleted");
        Ok(())
    }

    /// Enqueue a run right away and stamp `last_run`. Returns the job id.
    pub async fn trigger_job_now(&self, id: &str) -> Result<String> {
        let job = self
            .repo
            .get_scheduled_job(id)
            .await?
            .ok_or_else(|| Error::not_found("Scheduled job", id))?;
        let job_type = scheduled_type(&job.job_type)?;

        let job_id = self.queue.add_scheduled_job(job_type, Some(id)).await?;
        self.repo
            .record_run(id, &Utc::now().to_rfc3339(), &job_id)
            .await?;

        info!(scheduled_job_id = %id, %job_id, %job_type, "Scheduled job triggered");
        Ok(job_id)
    }

    pub async fn trigger_overdue_jobs(&self) -> Result<Vec<String>> {
        self.trigger_overdue_jobs_at(Utc::now()).await
    }

    /// Trigger every enabled job that missed its slot as of `now`.
    ///
    /// A job with no recorded run is always overdue; one with a schedule of
    /// unknown shape never is. Failures are logged per job.
    pub async fn trigger_overdue_jobs_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let jobs = self.repo.list_scheduled_jobs().await?;
        let mut triggered = Vec::new();

        for job in jobs.into_iter().filter(|j| j.enabled) {
            if !is_overdue(&job, now) {
                continue;
            }
            debug!(scheduled_job_id = %job.id, name = %job.name, last_run = ?job.last_run, "Scheduled job overdue");
            match self.trigger_job_now(&job.id).await {
                Ok(job_id) => triggered.push(job_id),
                Err(e) => warn!(
                    scheduled_job_id = %job.id,
                    name = %job.name,
                    error = %e,
                    "Failed to trigger overdue job"
                ),
            }
        }
        Ok(triggered)
    }

    pub async fn get_scheduled_jobs(&self) -> Result<Vec<ScheduledJobDbModel>> {
        self.repo.list_scheduled_jobs().await
    }

    pub async fn get_scheduled_job(&self, id: &str) -> Result<Option<ScheduledJobDbModel>> {
        self.repo.get_scheduled_job(id).await
    }
}

fn scheduled_type(job_type: &str) -> Result<JobType> {
    JobType::parse(job_type)
        .filter(JobType::is_scheduled)
        .ok_or_else(|| Error::validation(format!("Unknown job type: {job_type}")))
}

fn is_overdue(job: &ScheduledJobDbModel, now: DateTime<Utc>) -> bool {
    let Some(last_run) = job.last_run_at() else {
        return true;
    };
    let Some(interval) = cron_expr::estimate_interval(&job.schedule) else {
        return false;
    };
    let Ok(interval) = chrono::Duration::from_std(interval) else {
        return false;
    };
    now - last_run > interval
}
