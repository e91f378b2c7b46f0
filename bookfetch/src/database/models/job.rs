//! Job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Job database model.
/// Durable record of one unit of work, independent of the queue engine.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    /// Handle assigned by the queue engine, patched in after submission.
    pub engine_job_id: Option<String>,
    pub job_type: String,
    /// JSON payload as submitted (without the injected `jobId`).
    pub payload: String,
    pub priority: i64,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    /// Processor result, stored verbatim as JSON.
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    pub request_id: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    /// ISO 8601 timestamp when the job was created
    pub created_at: String,
    /// ISO 8601 timestamp when the job was last updated
    pub updated_at: String,
}

impl JobDbModel {
    pub fn new(job_type: JobType, payload: impl Into<String>, max_attempts: u32) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            engine_job_id: None,
            job_type: job_type.as_str().to_string(),
            payload: payload.into(),
            priority: job_type.priority() as i64,
            status: JobStatus::Pending.as_str().to_string(),
            attempts: 0,
            max_attempts: max_attempts as i64,
            result: None,
            error_message: None,
            stack_trace: None,
            request_id: None,
            started_at: None,
            completed_at: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    pub fn kind(&self) -> Option<JobType> {
        JobType::parse(&self.job_type)
    }
}

/// Job types known to the orchestrator.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    SearchIndexers,
    DownloadTorrent,
    MonitorDownload,
    OrganizeFiles,
    PlexLibraryScan,
    PlexRecentlyAddedCheck,
    AudibleRefresh,
    RetryMissingTorrents,
    RetryFailedImports,
    CleanupSeededTorrents,
    MonitorRssFeeds,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchIndexers => "search_indexers",
            Self::DownloadTorrent => "download_torrent",
            Self::MonitorDownload => "monitor_download",
            Self::OrganizeFiles => "organize_files",
            Self::PlexLibraryScan => "plex_library_scan",
            Self::PlexRecentlyAddedCheck => "plex_recently_added_check",
            Self::AudibleRefresh => "audible_refresh",
            Self::RetryMissingTorrents => "retry_missing_torrents",
            Self::RetryFailedImports => "retry_failed_imports",
            Self::CleanupSeededTorrents => "cleanup_seeded_torrents",
            Self::MonitorRssFeeds => "monitor_rss_feeds",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Dispatch priority; higher runs first.
    pub fn priority(&self) -> i32 {
        match self {
            Self::SearchIndexers => 10,
            Self::DownloadTorrent => 9,
            Self::OrganizeFiles => 8,
            Self::MonitorDownload => 5,
            Self::PlexRecentlyAddedCheck | Self::MonitorRssFeeds => 3,
            Self::PlexLibraryScan | Self::RetryMissingTorrents | Self::RetryFailedImports => 2,
            Self::AudibleRefresh | Self::CleanupSeededTorrents => 1,
        }
    }

    /// Whether this type runs from a scheduled definition rather than a request.
    pub fn is_scheduled(&self) -> bool {
        !matches!(
            self,
            Self::SearchIndexers
                | Self::DownloadTorrent
                | Self::MonitorDownload
                | Self::OrganizeFiles
        )
    }
}

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Row exists, engine has not started it.
    Pending,
    /// A worker is executing it.
    Active,
    /// Finished successfully.
    Completed,
    /// Failed after exhausting attempts, or cancelled.
    Failed,
    /// Failed an attempt and waits for the engine's retry.
    Delayed,
    /// The worker crashed while running it.
    Stuck,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
            Self::Stuck => "stuck",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}
