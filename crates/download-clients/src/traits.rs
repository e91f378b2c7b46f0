//! The contract every download-client adapter implements.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{AddDownloadOptions, ClientKind, ConnectionTestResult, DownloadInfo, Protocol};

/// Uniform operations over one download daemon.
#[async_trait]
pub trait DownloadClient: Send + Sync {
    /// Which daemon this adapter talks to.
    fn client_type(&self) -> ClientKind;

    fn protocol(&self) -> Protocol {
        self.client_type().protocol()
    }

    /// Check connectivity and credentials.
    ///
    /// Never returns `Err`; failures are folded into the result with an
    /// actionable message.
    async fn test_connection(&self) -> ConnectionTestResult;

    /// Submit a magnet link, `.torrent` URL or `.nzb` URL.
    ///
    /// Returns the daemon-side id. Submitting the same content twice returns
    /// the existing id without adding it again.
    async fn add_download(&self, source_url: &str, options: AddDownloadOptions) -> Result<String>;

    /// Look up an item in the active queue, then in history.
    ///
    /// Returns `None` for unknown or syntactically invalid ids.
    async fn get_download(&self, client_id: &str) -> Result<Option<DownloadInfo>>;

    async fn pause_download(&self, client_id: &str) -> Result<()>;

    async fn resume_download(&self, client_id: &str) -> Result<()>;

    async fn delete_download(&self, client_id: &str, delete_files: bool) -> Result<()>;

    /// Archive the item after it has been organized. No-op for daemons
    /// without an archival step.
    async fn post_process(&self, client_id: &str) -> Result<()>;
}
