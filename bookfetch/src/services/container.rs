//! Service container for dependency injection.
//!
//! The ServiceContainer holds references to all application services
//! and manages their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::database::repositories::{
    SqlxJobRepository, SqlxRequestRepository, SqlxScheduledJobRepository, SqlxSettingsRepository,
};
use crate::downloader::DownloadClientManager;
use crate::notification::{LogNotifier, Notifier};
use crate::processors::{DownloadTorrentProcessor, MonitorDownloadProcessor};
use crate::queue::{
    EngineConfig, EngineCounts, InMemoryQueueEngine, JobProcessor, JobQueue, JobQueueConfig,
    ProcessorRegistry,
};
use crate::scheduler::Scheduler;
use crate::{Error, Result};

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Database connection pool.
    pub pool: SqlitePool,
    pub settings: Arc<SqlxSettingsRepository>,
    pub requests: Arc<SqlxRequestRepository>,
    /// Download client manager.
    pub download_clients: Arc<DownloadClientManager>,
    /// Queue engine executing jobs.
    pub engine: Arc<InMemoryQueueEngine>,
    /// Durable job queue on top of the engine.
    pub job_queue: Arc<JobQueue>,
    /// Recurring job scheduler.
    pub scheduler: Arc<Scheduler>,
    /// Taken by `initialize`; processors registered afterwards are rejected.
    registry: Mutex<Option<ProcessorRegistry>>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Create a new service container with the default notifier.
    pub fn new(pool: SqlitePool, config: &AppConfig) -> Self {
        Self::with_notifier(pool, config, Arc::new(LogNotifier))
    }

    /// Create a new service container delivering failures to `notifier`.
    pub fn with_notifier(pool: SqlitePool, config: &AppConfig, notifier: Arc<dyn Notifier>) -> Self {
        info!("Initializing service container");

        let settings = Arc::new(SqlxSettingsRepository::new(pool.clone()));
        let requests = Arc::new(SqlxRequestRepository::new(pool.clone()));
        let jobs = Arc::new(SqlxJobRepository::new(pool.clone()));
        let scheduled_jobs = Arc::new(SqlxScheduledJobRepository::new(pool.clone()));

        let download_clients = Arc::new(DownloadClientManager::new(settings.clone()));

        let engine = Arc::new(InMemoryQueueEngine::new(EngineConfig {
            concurrency: config.worker_concurrency,
            job_timeout: config.job_timeout,
            backoff_base: config.backoff_base,
            ..EngineConfig::default()
        }));

        let job_queue = Arc::new(JobQueue::new(
            jobs,
            requests.clone(),
            engine.clone(),
            notifier,
            JobQueueConfig {
                max_attempts: config.max_attempts,
            },
        ));

        let scheduler = Arc::new(Scheduler::new(scheduled_jobs, job_queue.clone()));

        let registry = ProcessorRegistry::new()
            .with(Arc::new(DownloadTorrentProcessor::new(
                download_clients.clone(),
                requests.clone(),
                job_queue.clone(),
            )))
            .with(Arc::new(
                MonitorDownloadProcessor::new(
                    download_clients.clone(),
                    requests.clone(),
                    job_queue.clone(),
                )
                .with_interval(config.monitor_interval),
            ));

        Self {
            pool,
            settings,
            requests,
            download_clients,
            engine,
            job_queue,
            scheduler,
            registry: Mutex::new(Some(registry)),
            reconciler: Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Register a processor for a job type handled outside this crate
    /// (search, organize, maintenance). Must happen before `initialize`.
    pub fn register_processor(&self, processor: Arc<dyn JobProcessor>) -> Result<()> {
        let mut registry = self.registry.lock();
        let Some(registry) = registry.as_mut() else {
            return Err(Error::queue(format!(
                "Cannot register {} processor after the queue started",
                processor.job_type()
            )));
        };
        debug!(job_type = %processor.job_type(), "Registered job processor");
        registry.register(processor);
        Ok(())
    }

    /// Start the reconciler, the engine and the scheduler.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing services");

        let registry = self
            .registry
            .lock()
            .take()
            .ok_or_else(|| Error::queue("Services already initialized"))?;

        // The reconciler subscribes before the engine emits anything.
        let reconciler = self
            .job_queue
            .start_reconciler(self.cancellation_token.child_token());
        *self.reconciler.lock() = Some(reconciler);

        self.engine.start(Arc::new(registry));
        info!("Queue engine started");

        self.scheduler
            .start(self.cancellation_token.child_token())
            .await?;

        info!("Services initialized");
        Ok(())
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);

        // Signal all background tasks to stop
        self.cancellation_token.cancel();

        let reconciler = self.reconciler.lock().take();
        let shutdown_result = tokio::time::timeout(timeout, async {
            info!("Stopping queue engine...");
            self.engine.stop().await;

            self.scheduler.stop().await;
            debug!("Scheduler stopped");

            if let Some(handle) = reconciler
                && let Err(e) = handle.await
            {
                warn!(error = %e, "Job reconciler ended abnormally");
            }
        })
        .await;

        if shutdown_result.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        self.pool.close().await;
        info!("Services shut down");
        Ok(())
    }

    /// Get the cancellation token for background tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Check if the container is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Get service statistics.
    pub async fn stats(&self) -> Result<ServiceStats> {
        let scheduled = self.scheduler.get_scheduled_jobs().await?;
        let download_clients = self.download_clients.get_enabled_clients().await?.len();
        Ok(ServiceStats {
            queue: self.job_queue.get_stats().await,
            scheduled_job_count: scheduled.len(),
            enabled_scheduled_job_count: scheduled.iter().filter(|j| j.enabled).count(),
            enabled_download_client_count: download_clients,
        })
    }
}

/// Service statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    /// Engine job counts.
    pub queue: EngineCounts,
    pub scheduled_job_count: usize,
    pub enabled_scheduled_job_count: usize,
    pub enabled_download_client_count: usize,
}
