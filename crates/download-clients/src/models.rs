//! Protocol-agnostic types shared by all adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::path_mapping::PathMapping;

/// Supported download daemons.
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
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Qbittorrent,
    Transmission,
    Deluge,
    Sabnzbd,
    Nzbget,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qbittorrent => "qbittorrent",
            Self::Transmission => "transmission",
            Self::Deluge => "deluge",
            Self::Sabnzbd => "sabnzbd",
            Self::Nzbget => "nzbget",
        }
    }

    /// Human-readable daemon name used in logs and error messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Qbittorrent => "qBittorrent",
            Self::Transmission => "Transmission",
            Self::Deluge => "Deluge",
            Self::Sabnzbd => "SABnzbd",
            Self::Nzbget => "NZBGet",
        }
    }

    /// Static `type -> protocol` table.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Qbittorrent | Self::Transmission | Self::Deluge => Protocol::Torrent,
            Self::Sabnzbd | Self::Nzbget => Protocol::Usenet,
        }
    }
}

/// Transfer protocol served by a client.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Torrent,
    Usenet,
}

/// Normalized download status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Checking,
    Processing,
    Seeding,
    Completed,
    Failed,
}

impl DownloadStatus {
    /// Terminal from the orchestrator's point of view.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Seeding | Self::Completed | Self::Failed)
    }
}

/// Snapshot of one item inside a download daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfo {
    /// Client-side identifier (info-hash, nzo id or NZB id).
    pub id: String,
    pub name: String,
    /// Total size in bytes.
    pub size: u64,
    pub bytes_downloaded: u64,
    /// Completion ratio, always within `[0, 1]`.
    pub progress: f64,
    pub status: DownloadStatus,
    /// Bytes per second.
    pub download_speed: u64,
    /// Seconds remaining, 0 when unknown.
    pub eta: u64,
    pub category: String,
    /// Local view of the content path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Seconds spent seeding. Torrent clients only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeding_time: Option<u64>,
    /// Share ratio. Torrent clients only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
}

impl DownloadInfo {
    /// Create an item with zeroed counters.
    pub fn new(id: impl Into<String>, name: impl Into<String>, status: DownloadStatus) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            size: 0,
            bytes_downloaded: 0,
            progress: 0.0,
            status,
            download_speed: 0,
            eta: 0,
            category: String::new(),
            download_path: None,
            completed_at: None,
            error_message: None,
            seeding_time: None,
            ratio: None,
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = clamp_progress(progress);
        self
    }
}

/// Clamp a daemon-reported progress value into `[0, 1]`.
pub fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Optional knobs for `add_download`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddDownloadOptions {
    /// Overrides the configured category.
    pub category: Option<String>,
    pub priority: Option<DownloadPriority>,
    pub paused: Option<bool>,
}

impl AddDownloadOptions {
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_priority(mut self, priority: DownloadPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = Some(paused);
        self
    }
}

/// Daemon-side item priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadPriority {
    Low,
    #[default]
    Normal,
    High,
    Force,
}

/// Outcome of a connection test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub message: String,
}

impl ConnectionTestResult {
    pub fn ok(client: &str, version: impl Into<String>) -> Self {
        let version = version.into();
        Self {
            message: format!("Connected to {client} {version}"),
            success: true,
            version: Some(version),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            version: None,
            message: message.into(),
        }
    }
}

/// Typed authentication material, discriminated by daemon family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAuth {
    /// qBittorrent and NZBGet.
    Credentials { username: String, password: String },
    /// Transmission: basic auth only when a username is configured.
    OptionalBasic {
        username: Option<String>,
        password: Option<String>,
    },
    /// Deluge web UI password.
    Password(String),
    /// SABnzbd API key.
    ApiKey(String),
}

impl ClientAuth {
    pub fn username(&self) -> Option<&str> {
        match self {
            Self::Credentials { username, .. } => Some(username),
            Self::OptionalBasic { username, .. } => username.as_deref(),
            Self::Password(_) | Self::ApiKey(_) => None,
        }
    }

    /// Password or API key.
    pub fn secret(&self) -> Option<&str> {
        match self {
            Self::Credentials { password, .. } => Some(password),
            Self::OptionalBasic { password, .. } => password.as_deref(),
            Self::Password(secret) | Self::ApiKey(secret) => Some(secret),
        }
    }
}

/// Connection settings shared by every client kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConnection {
    /// Base URL without trailing slash.
    pub url: String,
    pub auth: ClientAuth,
    pub disable_ssl_verify: bool,
}

/// A validated download-client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadClientConfig {
    pub id: String,
    pub name: String,
    pub kind: ClientKind,
    pub enabled: bool,
    pub connection: ClientConnection,
    pub path_mapping: Option<PathMapping>,
    pub category: String,
    pub custom_path: Option<String>,
}

impl DownloadClientConfig {
    pub fn protocol(&self) -> Protocol {
        self.kind.protocol()
    }
}

/// Everything an adapter needs to talk to its daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSettings {
    pub connection: ClientConnection,
    pub path_mapping: Option<PathMapping>,
    pub category: String,
    /// Local destination for completed downloads.
    pub download_path: String,
}

impl AdapterSettings {
    /// Destination as seen by the daemon.
    pub fn remote_download_path(&self) -> String {
        match &self.path_mapping {
            Some(mapping) => mapping.to_remote(&self.download_path),
            None => self.download_path.clone(),
        }
    }

    /// Map a daemon path back into the local view.
    pub fn local_path(&self, remote: &str) -> String {
        match &self.path_mapping {
            Some(mapping) => mapping.to_local(remote),
            None => remote.to_string(),
        }
    }
}
