//! Concrete adapters and the closed [`ClientService`] union over them.

mod deluge;
mod nzbget;
mod qbittorrent;
mod sabnzbd;
mod transmission;

use async_trait::async_trait;

pub use deluge::DelugeClient;
pub use nzbget::{ConfigEntry, NzbgetClient};
pub use qbittorrent::QbittorrentClient;
pub use sabnzbd::SabnzbdClient;
pub use transmission::TransmissionClient;

use crate::error::Result;
use crate::models::{
    AdapterSettings, AddDownloadOptions, ClientKind, ConnectionTestResult, DownloadClientConfig,
    DownloadInfo,
};
use crate::traits::DownloadClient;

/// One live adapter, dispatched by client kind.
pub enum ClientService {
    Qbittorrent(QbittorrentClient),
    Transmission(TransmissionClient),
    Deluge(DelugeClient),
    Sabnzbd(SabnzbdClient),
    Nzbget(NzbgetClient),
}

macro_rules! dispatch {
    ($self:ident, $client:ident => $body:expr) => {
        match $self {
            ClientService::Qbittorrent($client) => $body,
            ClientService::Transmission($client) => $body,
            ClientService::Deluge($client) => $body,
            ClientService::Sabnzbd($client) => $body,
            ClientService::Nzbget($client) => $body,
        }
    };
}

impl ClientService {
    /// The single factory over client kinds.
    ///
    /// `download_path` is the local destination directory; the adapter maps
    /// it into the daemon's view through the configured path mapping.
    pub fn from_config(
        config: &DownloadClientConfig,
        download_path: impl Into<String>,
    ) -> Result<Self> {
        let settings = AdapterSettings {
            connection: config.connection.clone(),
            path_mapping: config.path_mapping.clone(),
            category: config.category.clone(),
            download_path: download_path.into(),
        };

        Ok(match config.kind {
            ClientKind::Qbittorrent => Self::Qbittorrent(QbittorrentClient::new(settings)?),
            ClientKind::Transmission => Self::Transmission(TransmissionClient::new(settings)?),
            ClientKind::Deluge => Self::Deluge(DelugeClient::new(settings)?),
            ClientKind::Sabnzbd => Self::Sabnzbd(SabnzbdClient::new(settings)?),
            ClientKind::Nzbget => Self::Nzbget(NzbgetClient::new(settings)?),
        })
    }
}

#[async_trait]
impl DownloadClient for ClientService {
    fn client_type(&self) -> ClientKind {
        dispatch!(self, c => c.client_type())
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        dispatch!(self, c => c.test_connection().await)
    }

    async fn add_download(&self, source_url: &str, options: AddDownloadOptions) -> Result<String> {
        dispatch!(self, c => c.add_download(source_url, options).await)
    }

    async fn get_download(&self, client_id: &str) -> Result<Option<DownloadInfo>> {
        dispatch!(self, c => c.get_download(client_id).await)
    }

    async fn pause_download(&self, client_id: &str) -> Result<()> {
        dispatch!(self, c => c.pause_download(client_id).await)
    }

    async fn resume_download(&self, client_id: &str) -> Result<()> {
        dispatch!(self, c => c.resume_download(client_id).await)
    }

    async fn delete_download(&self, client_id: &str, delete_files: bool) -> Result<()> {
        dispatch!(self, c => c.delete_download(client_id, delete_files).await)
    }

    async fn post_process(&self, client_id: &str) -> Result<()> {
        dispatch!(self, c => c.post_process(client_id).await)
    }
}
