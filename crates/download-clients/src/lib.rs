//! Download-client adapters.
//!
//! A uniform [`DownloadClient`] contract over five daemons:
//!
//! - [`QbittorrentClient`] - qBittorrent Web API v2 (session cookie)
//! - [`TransmissionClient`] - Transmission RPC (session-id header)
//! - [`DelugeClient`] - Deluge Web UI JSON-RPC (session cookie)
//! - [`SabnzbdClient`] - SABnzbd API (API key)
//! - [`NzbgetClient`] - NZBGet JSON-RPC (basic auth)
//!
//! Adapters normalize each daemon's status vocabulary into
//! [`DownloadStatus`], resolve magnet/torrent/NZB sources before submitting
//! them, and treat duplicate submissions idempotently. [`ClientService`] is
//! the closed union the rest of the application works with.
//!
//! ## License
//!
//! This project is licensed under the [MIT](./LICENSE.MIT) or
//! [Apache-2.0](./LICENSE.Apache-2.0) license. You can choose between one of
//! them if you use this work.
//!
//! `SPDX-License-Identifier: MIT OR Apache-2.0`

pub mod clients;
pub mod config;
pub mod error;
pub mod http;
pub mod models;
pub mod path_mapping;
pub mod source;
pub mod torrent;
pub mod traits;

pub use clients::{
    ClientService, DelugeClient, NzbgetClient, QbittorrentClient, SabnzbdClient,
    TransmissionClient,
};
pub use config::{DEFAULT_CATEGORY, StoredClientConfig};
pub use error::{ClientError, Result};
pub use models::{
    AdapterSettings, AddDownloadOptions, ClientAuth, ClientConnection, ClientKind,
    ConnectionTestResult, DownloadClientConfig, DownloadInfo, DownloadPriority, DownloadStatus,
    Protocol,
};
pub use path_mapping::PathMapping;
pub use traits::DownloadClient;
