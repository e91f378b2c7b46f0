//! Transmission RPC adapter.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::DateTime;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::http::build_client;
use crate::models::{
    AdapterSettings, AddDownloadOptions, ClientKind, ConnectionTestResult, DownloadInfo,
    DownloadStatus, clamp_progress,
};
use crate::source::{SourceFetcher, TorrentSource};
use crate::torrent::is_info_hash;
use crate::traits::DownloadClient;

const NAME: &str = "Transmission";
const SESSION_HEADER: &str = "X-Transmission-Session-Id";

const TORRENT_FIELDS: &[&str] = &[
    "hashString",
    "name",
    "totalSize",
    "sizeWhenDone",
    "leftUntilDone",
    "percentDone",
    "rateDownload",
    "eta",
    "status",
    "error",
    "errorString",
    "labels",
    "downloadDir",
    "doneDate",
    "secondsSeeding",
    "uploadRatio",
];

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Torrent {
    hash_string: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    total_size: i64,
    #[serde(default)]
    size_when_done: i64,
    #[serde(default)]
    left_until_done: i64,
    #[serde(default)]
    percent_done: f64,
    #[serde(default)]
    rate_download: i64,
    #[serde(default)]
    eta: i64,
    #[serde(default)]
    status: i64,
    #[serde(default)]
    error: i64,
    #[serde(default)]
    error_string: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    download_dir: String,
    #[serde(default)]
    done_date: i64,
    #[serde(default)]
    seconds_seeding: i64,
    #[serde(default)]
    upload_ratio: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddedTorrent {
    hash_string: String,
}

/// Map Transmission's numeric status. A non-zero `error` always wins.
pub(crate) fn map_status(status: i64, error: i64, progress: f64) -> DownloadStatus {
    if error != 0 {
        return DownloadStatus::Failed;
    }
    match status {
        0 if progress >= 1.0 => DownloadStatus::Completed,
        0 => DownloadStatus::Paused,
        1 | 2 => DownloadStatus::Checking,
        3 => DownloadStatus::Queued,
        4 => DownloadStatus::Downloading,
        5 | 6 => DownloadStatus::Seeding,
        other => {
            tracing::warn!(status = other, "Unknown Transmission status, treating as downloading");
            DownloadStatus::Downloading
        }
    }
}

/// Transmission adapter.
pub struct TransmissionClient {
    http: reqwest::Client,
    fetcher: SourceFetcher,
    settings: AdapterSettings,
    rpc_url: String,
    session_id: RwLock<Option<String>>,
}

impl TransmissionClient {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        let disable_ssl = settings.connection.disable_ssl_verify;
        let base = settings.connection.url.trim_end_matches('/');
        let rpc_url = if base.ends_with("/transmission/rpc") {
            base.to_string()
        } else {
            format!("{base}/transmission/rpc")
        };
        Ok(Self {
            http: build_client(disable_ssl)?,
            fetcher: SourceFetcher::new(NAME, disable_ssl)?,
            rpc_url,
            settings,
            session_id: RwLock::new(None),
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let mut request = self.http.post(&self.rpc_url).json(body);
        if let Some(session_id) = self.session_id.read().clone() {
            request = request.header(SESSION_HEADER, session_id);
        }
        let auth = &self.settings.connection.auth;
        if let Some(username) = auth.username().filter(|u| !u.is_empty()) {
            request = request.basic_auth(username, auth.secret());
        }
        request
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(NAME, &self.rpc_url, e))
    }

    /// Call an RPC method, capturing a fresh session id on 409 and retrying once.
    async fn call(&self, method: &str, arguments: Value) -> Result<Value> {
        let body = json!({ "method": method, "arguments": arguments, "tag": 1 });

        let mut response = self.post(&body).await?;
        if response.status() == StatusCode::CONFLICT {
            let session_id = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    ClientError::decode(NAME, "409 response without a session id header")
                })?;
            debug!("Captured new Transmission session id");
            *self.session_id.write() = Some(session_id);
            response = self.post(&body).await?;
        }

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ClientError::from_status(NAME, status.as_u16(), text));
        }

        let parsed: RpcResponse =
            serde_json::from_str(&text).map_err(|e| ClientError::decode(NAME, e.to_string()))?;
        if parsed.result != "success" {
            return Err(ClientError::rpc(NAME, method, parsed.result));
        }
        Ok(parsed.arguments)
    }

    async fn torrent(&self, hash: &str) -> Result<Option<Torrent>> {
        let arguments = self
            .call(
                "torrent-get",
                json!({ "ids": [hash], "fields": TORRENT_FIELDS }),
            )
            .await?;
        let torrents: Vec<Torrent> = serde_json::from_value(
            arguments.get("torrents").cloned().unwrap_or(Value::Array(Vec::new())),
        )
        .map_err(|e| ClientError::decode(NAME, e.to_string()))?;
        Ok(torrents
            .into_iter()
            .find(|t| t.hash_string.eq_ignore_ascii_case(hash)))
    }

    async fn control(&self, method: &str, hash: &str) -> Result<()> {
        self.call(method, json!({ "ids": [hash] })).await.map(|_| ())
    }

    fn to_download_info(&self, torrent: Torrent) -> DownloadInfo {
        let progress = clamp_progress(torrent.percent_done);
        let status = map_status(torrent.status, torrent.error, progress);
        let size = if torrent.size_when_done > 0 {
            torrent.size_when_done
        } else {
            torrent.total_size
        };
        let downloaded = (size - torrent.left_until_done).max(0);
        let download_path = (!torrent.download_dir.is_empty()).then(|| {
            self.settings.local_path(&format!(
                "{}/{}",
                torrent.download_dir.trim_end_matches('/'),
                torrent.name
            ))
        });

        DownloadInfo {
            id: torrent.hash_string.to_ascii_lowercase(),
            size: size.max(0) as u64,
            bytes_downloaded: downloaded as u64,
            progress,
            status,
            download_speed: torrent.rate_download.max(0) as u64,
            eta: torrent.eta.max(0) as u64,
            category: torrent.labels.into_iter().next().unwrap_or_default(),
            download_path,
            completed_at: (torrent.done_date > 0)
                .then(|| DateTime::from_timestamp(torrent.done_date, 0))
                .flatten(),
            error_message: (torrent.error != 0).then_some(torrent.error_string),
            seeding_time: Some(torrent.seconds_seeding.max(0) as u64),
            ratio: Some(torrent.upload_ratio.max(0.0)),
            name: torrent.name,
        }
    }
}

#[async_trait]
impl DownloadClient for TransmissionClient {
    fn client_type(&self) -> ClientKind {
        ClientKind::Transmission
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        match self.call("session-get", json!({ "fields": ["version"] })).await {
            Ok(arguments) => {
                let version = arguments
                    .get("version")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                ConnectionTestResult::ok(NAME, version)
            }
            Err(e) => ConnectionTestResult::failed(e.user_message()),
        }
    }

    async fn add_download(&self, source_url: &str, options: AddDownloadOptions) -> Result<String> {
        let source = self.fetcher.resolve_torrent(source_url).await?;
        let hash = source.info_hash().to_string();

        if self.torrent(&hash).await?.is_some() {
            info!(hash = %hash, "Torrent already present in Transmission");
            return Ok(hash);
        }

        let category = options
            .category
            .unwrap_or_else(|| self.settings.category.clone());
        let mut arguments = json!({
            "paused": options.paused.unwrap_or(false),
            "download-dir": self.settings.remote_download_path(),
            "labels": [category],
        });
        match &source {
            TorrentSource::Magnet { uri, .. } => arguments["filename"] = json!(uri),
            TorrentSource::File { data, .. } => arguments["metainfo"] = json!(BASE64.encode(data)),
        }

        let result = self.call("torrent-add", arguments).await.map_err(|e| match e {
            ClientError::Rpc { message, .. } => ClientError::rejected(NAME, message),
            other => other,
        })?;

        let added = result
            .get("torrent-added")
            .or_else(|| result.get("torrent-duplicate"))
            .cloned()
            .ok_or_else(|| ClientError::decode(NAME, "torrent-add returned no torrent"))?;
        let added: AddedTorrent =
            serde_json::from_value(added).map_err(|e| ClientError::decode(NAME, e.to_string()))?;

        info!(hash = %added.hash_string, "Added torrent to Transmission");
        Ok(added.hash_string.to_ascii_lowercase())
    }

    async fn get_download(&self, client_id: &str) -> Result<Option<DownloadInfo>> {
        if !is_info_hash(client_id) {
            return Ok(None);
        }
        let torrent = self.torrent(&client_id.to_ascii_lowercase()).await?;
        Ok(torrent.map(|t| self.to_download_info(t)))
    }

    async fn pause_download(&self, client_id: &str) -> Result<()> {
        self.control("torrent-stop", client_id).await
    }

    async fn resume_download(&self, client_id: &str) -> Result<()> {
        self.control("torrent-start", client_id).await
    }

    async fn delete_download(&self, client_id: &str, delete_files: bool) -> Result<()> {
        self.call(
            "torrent-remove",
            json!({ "ids": [client_id], "delete-local-data": delete_files }),
        )
        .await
        .map(|_| ())
    }

    async fn post_process(&self, _client_id: &str) -> Result<()> {
        Ok(())
    }
}
