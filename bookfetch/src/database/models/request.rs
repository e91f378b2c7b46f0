//! Request and download-history rows, as far as the orchestrator touches them.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Request status values written by the download pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Searching,
    Downloading,
    Processing,
    Downloaded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct RequestDbModel {
    pub id: String,
    pub status: String,
    pub progress: f64,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl RequestDbModel {
    pub fn new(id: impl Into<String>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: id.into(),
            status: RequestStatus::Pending.to_string(),
            progress: 0.0,
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// One attempt at fetching a request's content through a download client.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct DownloadHistoryDbModel {
    pub id: String,
    pub request_id: String,
    pub indexer_name: Option<String>,
    pub torrent_name: String,
    /// Client kind (`qbittorrent`, `sabnzbd`, ...).
    pub download_client: String,
    /// Identifier inside the daemon (info-hash, nzo id, NZB id).
    pub download_client_id: Option<String>,
    pub download_status: String,
    pub download_error: Option<String>,
    pub download_path: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl DownloadHistoryDbModel {
    pub fn new(
        request_id: impl Into<String>,
        torrent_name: impl Into<String>,
        download_client: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            indexer_name: None,
            torrent_name: torrent_name.into(),
            download_client: download_client.into(),
            download_client_id: None,
            download_status: "queued".to_string(),
            download_error: None,
            download_path: None,
            started_at: now.clone(),
            completed_at: None,
            updated_at: now,
        }
    }
}
