//! Monitor processor: polls a submitted download until it finishes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use download_clients::{DownloadClient, DownloadInfo, DownloadStatus};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::database::models::{JobType, RequestStatus};
use crate::database::repositories::RequestRepository;
use crate::downloader::DownloadClientManager;
use crate::queue::{JobContext, JobPayload, JobProcessor, JobQueue, MonitorTarget};
use crate::{Error, Result};

/// Default delay between two polls of the same download.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Processor for `monitor_download` jobs.
///
/// Each run polls once. Unfinished downloads re-enqueue another monitor job
/// after `interval`; finished ones hand over to `organize_files`.
pub struct MonitorDownloadProcessor {
    clients: Arc<DownloadClientManager>,
    requests: Arc<dyn RequestRepository>,
    queue: Arc<JobQueue>,
    interval: Duration,
}

impl MonitorDownloadProcessor {
    pub fn new(
        clients: Arc<DownloadClientManager>,
        requests: Arc<dyn RequestRepository>,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            clients,
            requests,
            queue,
            interval: DEFAULT_MONITOR_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    async fn complete(
        &self,
        target: &MonitorTarget,
        info: &DownloadInfo,
        service: &dyn DownloadClient,
    ) -> Result<Value> {
        let download_path = match &info.download_path {
            Some(path) => path.clone(),
            None => Path::new(&self.clients.download_dir().await?)
                .join(&info.name)
                .to_string_lossy()
                .into_owned(),
        };

        if let Some(mut history) = self
            .requests
            .get_download_history(&target.download_history_id)
            .await?
        {
            history.download_status = "completed".to_string();
            history.download_path = Some(download_path.clone());
            history.completed_at = Some(Utc::now().to_rfc3339());
            self.requests.update_download_history(&history).await?;
        }
        self.requests
            .update_request_progress(&target.request_id, 1.0)
            .await?;
        self.requests
            .update_request_status(&target.request_id, RequestStatus::Downloaded, None)
            .await?;

        if let Err(e) = service.post_process(&target.client_item_id).await {
            warn!(
                client_item_id = %target.client_item_id,
                error = %e,
                "Post-processing in download client failed"
            );
        }

        let organize_job_id = self
            .queue
            .add_organize_job(&target.request_id, &target.audiobook_id, &download_path)
            .await?;

        info!(
            request_id = %target.request_id,
            %download_path,
            "Download finished, organizing files"
        );

        Ok(json!({
            "status": info.status,
            "downloadPath": download_path,
            "organizeJobId": organize_job_id,
        }))
    }

    async fn reschedule(&self, target: &MonitorTarget, info: &DownloadInfo) -> Result<Value> {
        if let Some(mut history) = self
            .requests
            .get_download_history(&target.download_history_id)
            .await?
        {
            history.download_status = info.status.to_string();
            self.requests.update_download_history(&history).await?;
        }
        self.requests
            .update_request_progress(&target.request_id, info.progress)
            .await?;

        let next_job_id = self
            .queue
            .add_monitor_job(target.clone(), self.interval)
            .await?;

        debug!(
            client_item_id = %target.client_item_id,
            status = %info.status,
            progress = info.progress,
            "Download in progress"
        );

        Ok(json!({
            "status": info.status,
            "progress": info.progress,
            "nextCheckJobId": next_job_id,
        }))
    }
}

#[async_trait]
impl JobProcessor for MonitorDownloadProcessor {
    fn job_type(&self) -> JobType {
        JobType::MonitorDownload
    }

    async fn process(&self, ctx: &JobContext) -> Result<Value> {
        let JobPayload::MonitorDownload(target) = &ctx.payload else {
            return Err(Error::queue("monitor_download job carries a different payload"));
        };

        let service = self
            .clients
            .get_client_service(&target.download_client_id)
            .await?
            .ok_or_else(|| {
                Error::config(format!(
                    "Download client {} is no longer configured",
                    target.download_client_id
                ))
            })?;

        let info = service
            .get_download(&target.client_item_id)
            .await?
            .ok_or_else(|| Error::not_found("Download", &target.client_item_id))?;

        match info.status {
            DownloadStatus::Failed => Err(Error::Other(format!(
                "Download failed: {}",
                info.error_message
                    .as_deref()
                    .unwrap_or("download client reported an error")
            ))),
            DownloadStatus::Completed | DownloadStatus::Seeding => {
                self.complete(target, &info, service.as_ref()).await
            }
            _ => self.reschedule(target, &info).await,
        }
    }
}
