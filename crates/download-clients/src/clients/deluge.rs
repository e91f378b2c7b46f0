//! Deluge Web UI JSON-RPC adapter.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::DateTime;
use reqwest::header::{COOKIE, SET_COOKIE};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::http::build_client;
use crate::models::{
    AdapterSettings, AddDownloadOptions, ClientKind, ConnectionTestResult, DownloadInfo,
    DownloadStatus, clamp_progress,
};
use crate::path_mapping::paths_equal;
use crate::source::{SourceFetcher, TorrentSource};
use crate::torrent::is_info_hash;
use crate::traits::DownloadClient;

const NAME: &str = "Deluge";
const LABEL_PLUGIN: &str = "Label";
const NOT_AUTHENTICATED: i64 = 1;

const STATUS_FIELDS: &[&str] = &[
    "name",
    "total_size",
    "total_done",
    "progress",
    "download_payload_rate",
    "eta",
    "state",
    "label",
    "save_path",
    "completed_time",
    "seeding_time",
    "ratio",
    "message",
];

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcError>,
}

#[derive(Debug, Default, Deserialize)]
struct TorrentStatus {
    #[serde(default)]
    name: String,
    #[serde(default)]
    total_size: i64,
    #[serde(default)]
    total_done: i64,
    /// Percentage, 0-100.
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    download_payload_rate: i64,
    #[serde(default)]
    eta: f64,
    #[serde(default)]
    state: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    save_path: String,
    #[serde(default)]
    completed_time: f64,
    #[serde(default)]
    seeding_time: f64,
    #[serde(default)]
    ratio: f64,
    #[serde(default)]
    message: String,
}

pub(crate) fn map_state(state: &str, progress: f64) -> DownloadStatus {
    match state {
        "Error" => DownloadStatus::Failed,
        "Paused" if progress >= 1.0 => DownloadStatus::Completed,
        "Paused" => DownloadStatus::Paused,
        "Checking" => DownloadStatus::Checking,
        "Queued" => DownloadStatus::Queued,
        "Downloading" | "Allocating" => DownloadStatus::Downloading,
        "Seeding" => DownloadStatus::Seeding,
        "Moving" => DownloadStatus::Processing,
        other => {
            warn!(state = %other, "Unknown Deluge state, treating as downloading");
            DownloadStatus::Downloading
        }
    }
}

/// Deluge adapter talking to the Web UI's `/json` endpoint.
pub struct DelugeClient {
    http: reqwest::Client,
    fetcher: SourceFetcher,
    settings: AdapterSettings,
    rpc_url: String,
    next_id: AtomicU64,
    cookie: RwLock<Option<String>>,
    login_lock: Mutex<()>,
}

impl DelugeClient {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        let disable_ssl = settings.connection.disable_ssl_verify;
        let base = settings.connection.url.trim_end_matches('/');
        let rpc_url = if base.ends_with("/json") {
            base.to_string()
        } else {
            format!("{base}/json")
        };
        Ok(Self {
            http: build_client(disable_ssl)?,
            fetcher: SourceFetcher::new(NAME, disable_ssl)?,
            rpc_url,
            settings,
            next_id: AtomicU64::new(1),
            cookie: RwLock::new(None),
            login_lock: Mutex::new(()),
        })
    }

    async fn post(
        &self,
        method: &str,
        params: &Value,
        cookie: Option<&str>,
    ) -> Result<(RpcResponse, Option<String>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut request = self
            .http
            .post(&self.rpc_url)
            .json(&json!({ "method": method, "params": params, "id": id }));
        if let Some(cookie) = cookie {
            request = request.header(COOKIE, cookie);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(NAME, &self.rpc_url, e))?;

        let set_cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .find(|pair| pair.trim_start().starts_with("_session_id="))
            .map(|pair| pair.trim().to_string());

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ClientError::from_status(NAME, status.as_u16(), text));
        }

        let parsed: RpcResponse =
            serde_json::from_str(&text).map_err(|e| ClientError::decode(NAME, e.to_string()))?;
        Ok((parsed, set_cookie))
    }

    /// Log in and make sure the Web UI is attached to a daemon.
    async fn login(&self) -> Result<String> {
        let password = self.settings.connection.auth.secret().unwrap_or_default();
        let (response, cookie) = self.post("auth.login", &json!([password]), None).await?;
        if let Some(error) = response.error {
            return Err(ClientError::rpc(NAME, "auth.login", error.message));
        }
        if response.result != Value::Bool(true) {
            return Err(ClientError::Auth {
                client: NAME,
                message: "invalid password".to_string(),
            });
        }
        let cookie = cookie.unwrap_or_default();
        debug!("Logged in to Deluge Web UI");

        self.ensure_daemon_connection(&cookie).await?;
        Ok(cookie)
    }

    async fn ensure_daemon_connection(&self, cookie: &str) -> Result<()> {
        let connected = self.raw_call("web.connected", json!([]), cookie).await?;
        if connected == Value::Bool(true) {
            return Ok(());
        }

        let hosts = self.raw_call("web.get_hosts", json!([]), cookie).await?;
        let host_id = hosts
            .as_array()
            .and_then(|hosts| hosts.first())
            .and_then(|host| host.get(0))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ClientError::rpc(NAME, "web.get_hosts", "no daemon hosts configured in the Web UI")
            })?
            .to_string();

        self.raw_call("web.connect", json!([host_id]), cookie).await?;
        info!(host_id = %host_id, "Connected Deluge Web UI to daemon");
        Ok(())
    }

    async fn raw_call(&self, method: &str, params: Value, cookie: &str) -> Result<Value> {
        let cookie = (!cookie.is_empty()).then_some(cookie);
        let (response, _) = self.post(method, &params, cookie).await?;
        match response.error {
            Some(error) => Err(ClientError::rpc(NAME, method, error.message)),
            None => Ok(response.result),
        }
    }

    async fn session(&self) -> Result<String> {
        if let Some(cookie) = self.cookie.read().await.clone() {
            return Ok(cookie);
        }
        self.refresh_session(None).await
    }

    async fn refresh_session(&self, stale: Option<&str>) -> Result<String> {
        let _guard = self.login_lock.lock().await;
        if let Some(current) = self.cookie.read().await.clone()
            && Some(current.as_str()) != stale
        {
            return Ok(current);
        }
        let cookie = self.login().await?;
        *self.cookie.write().await = Some(cookie.clone());
        Ok(cookie)
    }

    /// Call an RPC method, re-authenticating once on "Not authenticated".
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let cookie = self.session().await?;
        let (response, _) = self
            .post(method, &params, (!cookie.is_empty()).then_some(cookie.as_str()))
            .await?;

        let expired = response.error.as_ref().is_some_and(is_auth_error);
        let response = if expired {
            debug!(method = %method, "Deluge session expired, re-authenticating");
            let cookie = self.refresh_session(Some(&cookie)).await?;
            let (retry, _) = self
                .post(method, &params, (!cookie.is_empty()).then_some(cookie.as_str()))
                .await?;
            if let Some(error) = &retry.error
                && is_auth_error(error)
            {
                return Err(ClientError::Auth {
                    client: NAME,
                    message: error.message.clone(),
                });
            }
            retry
        } else {
            response
        };

        match response.error {
            Some(error) => Err(ClientError::rpc(NAME, method, error.message)),
            None => Ok(response.result),
        }
    }

    async fn status(&self, hash: &str) -> Result<Option<TorrentStatus>> {
        let result = self
            .call("core.get_torrent_status", json!([hash, STATUS_FIELDS]))
            .await?;
        match result {
            Value::Object(map) if !map.is_empty() => serde_json::from_value(Value::Object(map))
                .map(Some)
                .map_err(|e| ClientError::decode(NAME, e.to_string())),
            _ => Ok(None),
        }
    }

    /// Make sure the Label plugin is enabled and the label moves completed
    /// downloads into the configured directory. Failures are logged.
    pub async fn ensure_label(&self, label: &str) {
        if let Err(e) = self.try_ensure_label(label).await {
            warn!(label = %label, error = %e, "Failed to ensure Deluge label");
        }
    }

    async fn try_ensure_label(&self, label: &str) -> Result<()> {
        let plugins = self.call("core.get_enabled_plugins", json!([])).await?;
        let enabled = plugins
            .as_array()
            .is_some_and(|list| list.iter().any(|p| p.as_str() == Some(LABEL_PLUGIN)));
        if !enabled {
            self.call("core.enable_plugin", json!([LABEL_PLUGIN])).await?;
            info!("Enabled Deluge Label plugin");
        }

        let labels = self.call("label.get_labels", json!([])).await?;
        let exists = labels
            .as_array()
            .is_some_and(|list| list.iter().any(|l| l.as_str() == Some(label)));
        if !exists {
            self.call("label.add", json!([label])).await?;
        }

        let desired = self.settings.remote_download_path();
        if exists {
            let options = self.call("label.get_options", json!([label])).await?;
            let current = options
                .get("move_completed_path")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let moving = options
                .get("move_completed")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if moving && paths_equal(current, &desired) {
                return Ok(());
            }
        }

        self.call(
            "label.set_options",
            json!([label, { "move_completed": true, "move_completed_path": desired }]),
        )
        .await?;
        info!(label = %label, path = %desired, "Configured Deluge label");
        Ok(())
    }

    fn to_download_info(&self, hash: &str, status: TorrentStatus) -> DownloadInfo {
        let progress = clamp_progress(status.progress / 100.0);
        let state = map_state(&status.state, progress);
        let download_path = (!status.save_path.is_empty()).then(|| {
            self.settings.local_path(&format!(
                "{}/{}",
                status.save_path.trim_end_matches('/'),
                status.name
            ))
        });

        DownloadInfo {
            id: hash.to_ascii_lowercase(),
            size: status.total_size.max(0) as u64,
            bytes_downloaded: status.total_done.max(0) as u64,
            progress,
            status: state,
            download_speed: status.download_payload_rate.max(0) as u64,
            eta: status.eta.max(0.0) as u64,
            category: status.label,
            download_path,
            completed_at: (status.completed_time > 0.0)
                .then(|| DateTime::from_timestamp(status.completed_time as i64, 0))
                .flatten(),
            error_message: (state == DownloadStatus::Failed).then_some(status.message),
            seeding_time: Some(status.seeding_time.max(0.0) as u64),
            ratio: Some(status.ratio.max(0.0)),
            name: status.name,
        }
    }
}

fn is_auth_error(error: &RpcError) -> bool {
    error.code == NOT_AUTHENTICATED || error.message.contains("Not authenticated")
}

#[async_trait]
impl DownloadClient for DelugeClient {
    fn client_type(&self) -> ClientKind {
        ClientKind::Deluge
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        match self.call("daemon.info", json!([])).await {
            Ok(version) => {
                let version = version.as_str().unwrap_or("unknown").to_string();
                ConnectionTestResult::ok(NAME, version)
            }
            Err(e) => ConnectionTestResult::failed(e.user_message()),
        }
    }

    async fn add_download(&self, source_url: &str, options: AddDownloadOptions) -> Result<String> {
        let source = self.fetcher.resolve_torrent(source_url).await?;
        let hash = source.info_hash().to_string();

        if self.status(&hash).await?.is_some() {
            info!(hash = %hash, "Torrent already present in Deluge");
            return Ok(hash);
        }

        // Deluge only accepts lowercase label names.
        let label = options
            .category
            .unwrap_or_else(|| self.settings.category.clone())
            .to_lowercase();
        self.ensure_label(&label).await;

        let add_options = json!({
            "add_paused": options.paused.unwrap_or(false),
            "download_location": self.settings.remote_download_path(),
        });

        let (method, params) = match &source {
            TorrentSource::Magnet { uri, .. } => {
                ("core.add_torrent_magnet", json!([uri, add_options]))
            }
            TorrentSource::File { data, filename, .. } => (
                "core.add_torrent_file",
                json!([filename, BASE64.encode(data), add_options]),
            ),
        };

        let added = self.call(method, params).await.map_err(|e| match e {
            ClientError::Rpc { message, .. } => ClientError::rejected(NAME, message),
            other => other,
        })?;
        let added = added
            .as_str()
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| hash.clone());

        if let Err(e) = self.call("label.set_torrent", json!([added, label])).await {
            warn!(hash = %added, label = %label, error = %e, "Failed to label Deluge torrent");
        }

        info!(hash = %added, "Added torrent to Deluge");
        Ok(added)
    }

    async fn get_download(&self, client_id: &str) -> Result<Option<DownloadInfo>> {
        if !is_info_hash(client_id) {
            return Ok(None);
        }
        let status = self.status(&client_id.to_ascii_lowercase()).await?;
        Ok(status.map(|s| self.to_download_info(client_id, s)))
    }

    async fn pause_download(&self, client_id: &str) -> Result<()> {
        self.call("core.pause_torrent", json!([client_id]))
            .await
            .map(|_| ())
    }

    async fn resume_download(&self, client_id: &str) -> Result<()> {
        self.call("core.resume_torrent", json!([client_id]))
            .await
            .map(|_| ())
    }

    async fn delete_download(&self, client_id: &str, delete_files: bool) -> Result<()> {
        self.call("core.remove_torrent", json!([client_id, delete_files]))
            .await
            .map(|_| ())
    }

    async fn post_process(&self, _client_id: &str) -> Result<()> {
        Ok(())
    }
}
