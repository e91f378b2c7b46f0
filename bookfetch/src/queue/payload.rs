//! Typed job payloads.
//!
//! On the wire a payload is a camelCase JSON object tagged by `type`, e.g.
//! `{"type":"monitor_download","jobId":"...","requestId":"...",...}`.
//! `jobId` is injected by the job queue right before engine submission and
//! is not part of the typed payload.

use download_clients::Protocol;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::models::JobType;
use crate::{Error, Result};

/// Key the job queue injects into every engine payload.
pub const JOB_ID_KEY: &str = "jobId";

/// Key identifying the scheduled definition behind a run.
pub const SCHEDULED_JOB_ID_KEY: &str = "scheduledJobId";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudiobookRef {
    pub id: String,
    pub title: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asin: Option<String>,
}

/// A release picked from indexer search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResultRef {
    pub title: String,
    /// Magnet URI, `.torrent` URL or `.nzb` URL.
    pub download_url: String,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<String>,
}

fn default_protocol() -> Protocol {
    Protocol::Torrent
}

/// A submitted download being watched until it finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorTarget {
    pub request_id: String,
    pub audiobook_id: String,
    pub download_history_id: String,
    /// Download client config id.
    pub download_client_id: String,
    /// Item id inside the daemon.
    pub client_item_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledRun {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    #[serde(rename_all = "camelCase")]
    SearchIndexers {
        request_id: String,
        audiobook: AudiobookRef,
    },
    #[serde(rename_all = "camelCase")]
    DownloadTorrent {
        request_id: String,
        audiobook_id: String,
        torrent: SearchResultRef,
    },
    MonitorDownload(MonitorTarget),
    #[serde(rename_all = "camelCase")]
    OrganizeFiles {
        request_id: String,
        audiobook_id: String,
        download_path: String,
    },
    PlexLibraryScan(ScheduledRun),
    PlexRecentlyAddedCheck(ScheduledRun),
    AudibleRefresh(ScheduledRun),
    RetryMissingTorrents(ScheduledRun),
    RetryFailedImports(ScheduledRun),
    CleanupSeededTorrents(ScheduledRun),
    MonitorRssFeeds(ScheduledRun),
}

impl JobPayload {
    /// Payload of a scheduled run for `job_type`.
    pub fn scheduled(job_type: JobType, scheduled_job_id: Option<String>) -> Result<Self> {
        let run = ScheduledRun { scheduled_job_id };
        Ok(match job_type {
            JobType::PlexLibraryScan => Self::PlexLibraryScan(run),
            JobType::PlexRecentlyAddedCheck => Self::PlexRecentlyAddedCheck(run),
            JobType::AudibleRefresh => Self::AudibleRefresh(run),
            JobType::RetryMissingTorrents => Self::RetryMissingTorrents(run),
            JobType::RetryFailedImports => Self::RetryFailedImports(run),
            JobType::CleanupSeededTorrents => Self::CleanupSeededTorrents(run),
            JobType::MonitorRssFeeds => Self::MonitorRssFeeds(run),
            other => {
                return Err(Error::validation(format!(
                    "{other} is not a scheduled job type"
                )));
            }
        })
    }

    pub fn job_type(&self) -> JobType {
        match self {
            Self::SearchIndexers { .. } => JobType::SearchIndexers,
            Self::DownloadTorrent { .. } => JobType::DownloadTorrent,
            Self::MonitorDownload(_) => JobType::MonitorDownload,
            Self::OrganizeFiles { .. } => JobType::OrganizeFiles,
            Self::PlexLibraryScan(_) => JobType::PlexLibraryScan,
            Self::PlexRecentlyAddedCheck(_) => JobType::PlexRecentlyAddedCheck,
            Self::AudibleRefresh(_) => JobType::AudibleRefresh,
            Self::RetryMissingTorrents(_) => JobType::RetryMissingTorrents,
            Self::RetryFailedImports(_) => JobType::RetryFailedImports,
            Self::CleanupSeededTorrents(_) => JobType::CleanupSeededTorrents,
            Self::MonitorRssFeeds(_) => JobType::MonitorRssFeeds,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::SearchIndexers { request_id, .. }
            | Self::DownloadTorrent { request_id, .. }
            | Self::OrganizeFiles { request_id, .. } => Some(request_id),
            Self::MonitorDownload(target) => Some(&target.request_id),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// JSON handed to the engine, with `jobId` injected.
    pub fn to_engine_value(&self, job_id: &str) -> Result<Value> {
        let mut value = self.to_value()?;
        if let Value::Object(map) = &mut value {
            map.insert(JOB_ID_KEY.to_string(), Value::String(job_id.to_string()));
        }
        Ok(value)
    }

    /// Parse an engine payload; unknown keys such as `jobId` are ignored.
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// `jobId` of an engine payload, when present.
pub fn job_id_of(data: &Value) -> Option<&str> {
    data.get(JOB_ID_KEY).and_then(Value::as_str)
}

/// `scheduledJobId` of an engine payload, when present.
pub fn scheduled_job_id_of(data: &Value) -> Option<&str> {
    data.get(SCHEDULED_JOB_ID_KEY).and_then(Value::as_str)
}
