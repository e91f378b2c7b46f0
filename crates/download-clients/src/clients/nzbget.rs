//! NZBGet JSON-RPC adapter.
//!
//! NZBGet has no API for creating categories; they live in the daemon's
//! configuration file as numbered `CategoryN.*` keys. Ensuring a category
//! therefore means rewriting the whole configuration and reloading the
//! daemon, which [`NzbgetClient::ensure_category`] does only when needed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::http::build_client;
use crate::models::{
    AdapterSettings, AddDownloadOptions, ClientKind, ConnectionTestResult, DownloadInfo,
    DownloadPriority, DownloadStatus, clamp_progress,
};
use crate::path_mapping::paths_equal;
use crate::source::{NzbPayload, SourceFetcher, nzb_names_match, strip_nzb_extensions};
use crate::traits::DownloadClient;

const NAME: &str = "NZBGet";

/// Keys NZBGet reports but refuses on `saveconfig`.
const READ_ONLY_KEYS: &[&str] = &["ConfigFile", "AppBin", "AppDir", "Version"];

const RELOAD_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RELOAD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Group {
    #[serde(rename = "NZBID")]
    nzb_id: i64,
    #[serde(rename = "NZBName", default)]
    nzb_name: String,
    #[serde(rename = "NZBFilename", default)]
    nzb_filename: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    file_size_lo: u32,
    #[serde(default)]
    file_size_hi: u32,
    #[serde(default)]
    remaining_size_lo: u32,
    #[serde(default)]
    remaining_size_hi: u32,
    #[serde(default)]
    status: String,
    #[serde(default)]
    dest_dir: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HistoryItem {
    #[serde(rename = "NZBID")]
    nzb_id: i64,
    #[serde(default)]
    name: String,
    #[serde(rename = "NZBFilename", default)]
    nzb_filename: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    file_size_lo: u32,
    #[serde(default)]
    file_size_hi: u32,
    #[serde(default)]
    status: String,
    #[serde(default)]
    dest_dir: String,
    #[serde(default)]
    final_dir: String,
    #[serde(default)]
    history_time: i64,
}

fn combine(lo: u32, hi: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Queue statuses. Everything between the transfer and the final move
/// collapses to `processing`.
pub(crate) fn map_queue_status(status: &str) -> DownloadStatus {
    match status {
        "QUEUED" | "FETCHING" => DownloadStatus::Queued,
        "PAUSED" => DownloadStatus::Paused,
        "DOWNLOADING" => DownloadStatus::Downloading,
        "PP_QUEUED" | "LOADING_PARS" | "VERIFYING_SOURCES" | "REPAIRING"
        | "VERIFYING_REPAIRED" | "RENAMING" | "UNPACKING" | "MOVING" | "EXECUTING_SCRIPT"
        | "PP_FINISHED" => DownloadStatus::Processing,
        other => {
            warn!(status = %other, "Unknown NZBGet queue status, treating as downloading");
            DownloadStatus::Downloading
        }
    }
}

/// History statuses have the form `PREFIX/DETAIL`.
pub(crate) fn map_history_status(status: &str) -> DownloadStatus {
    let prefix = status.split('/').next().unwrap_or_default();
    match prefix {
        "SUCCESS" | "WARNING" => DownloadStatus::Completed,
        "FAILURE" | "DELETED" => DownloadStatus::Failed,
        _ => {
            warn!(status = %status, "Unknown NZBGet history status, treating as failed");
            DownloadStatus::Failed
        }
    }
}

fn priority_value(priority: DownloadPriority) -> i64 {
    match priority {
        DownloadPriority::Low => -50,
        DownloadPriority::Normal => 0,
        DownloadPriority::High => 50,
        DownloadPriority::Force => 900,
    }
}

/// Parse `CategoryN.Field` into `(N, Field)`.
fn category_key(name: &str) -> Option<(u32, &str)> {
    let rest = name.strip_prefix("Category")?;
    let (index, field) = rest.split_once('.')?;
    Some((index.parse().ok()?, field))
}

/// The outcome of planning a category change against a configuration.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CategoryPlan {
    Unchanged,
    Write(Vec<ConfigEntry>),
}

/// Decide whether `category` needs to be (re)written and, if so, build the
/// full configuration to save.
pub(crate) fn plan_category(
    config: &[ConfigEntry],
    category: &str,
    dest_dir: &str,
) -> CategoryPlan {
    let mut slot = None;
    let mut highest = 0;
    for entry in config {
        if let Some((index, field)) = category_key(&entry.name) {
            highest = highest.max(index);
            if field == "Name" && entry.value.eq_ignore_ascii_case(category) {
                slot = Some(index);
            }
        }
    }

    let index = match slot {
        Some(index) => {
            let dest_key = format!("Category{index}.DestDir");
            let current = config
                .iter()
                .find(|e| e.name == dest_key)
                .map(|e| e.value.as_str())
                .unwrap_or_default();
            if paths_equal(current, dest_dir) {
                return CategoryPlan::Unchanged;
            }
            index
        }
        None => highest + 1,
    };

    let updates = [
        (format!("Category{index}.Name"), category.to_string()),
        (format!("Category{index}.DestDir"), dest_dir.to_string()),
    ];

    let read_only: HashSet<&str> = READ_ONLY_KEYS.iter().copied().collect();
    let mut merged: Vec<ConfigEntry> = config
        .iter()
        .filter(|e| !read_only.contains(e.name.as_str()))
        .cloned()
        .collect();

    for (name, value) in updates {
        match merged.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.value = value,
            None => merged.push(ConfigEntry { name, value }),
        }
    }

    CategoryPlan::Write(merged)
}

/// NZBGet adapter.
pub struct NzbgetClient {
    http: reqwest::Client,
    fetcher: SourceFetcher,
    settings: AdapterSettings,
    rpc_url: String,
    next_id: AtomicU64,
    reload_poll_interval: Duration,
    reload_timeout: Duration,
}

impl NzbgetClient {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        let disable_ssl = settings.connection.disable_ssl_verify;
        let base = settings.connection.url.trim_end_matches('/');
        let rpc_url = if base.ends_with("/jsonrpc") {
            base.to_string()
        } else {
            format!("{base}/jsonrpc")
        };
        Ok(Self {
            http: build_client(disable_ssl)?,
            fetcher: SourceFetcher::new(NAME, disable_ssl)?,
            rpc_url,
            settings,
            next_id: AtomicU64::new(1),
            reload_poll_interval: RELOAD_POLL_INTERVAL,
            reload_timeout: RELOAD_TIMEOUT,
        })
    }

    /// Override the reload wait, mostly for tests.
    pub fn with_reload_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.reload_poll_interval = interval;
        self.reload_timeout = timeout;
        self
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut request = self.http.post(&self.rpc_url).json(&json!({
            "version": "1.1",
            "id": id,
            "method": method,
            "params": params,
        }));
        let auth = &self.settings.connection.auth;
        if let Some(username) = auth.username().filter(|u| !u.is_empty()) {
            request = request.basic_auth(username, auth.secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(NAME, &self.rpc_url, e))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ClientError::from_status(NAME, status.as_u16(), text));
        }

        let parsed: RpcResponse =
            serde_json::from_str(&text).map_err(|e| ClientError::decode(NAME, e.to_string()))?;
        match parsed.error {
            Some(error) => Err(ClientError::rpc(NAME, method, error.message)),
            None => Ok(parsed.result),
        }
    }

    async fn groups(&self) -> Result<Vec<Group>> {
        let result = self.call("listgroups", json!([0])).await?;
        serde_json::from_value(result).map_err(|e| ClientError::decode(NAME, e.to_string()))
    }

    async fn history(&self) -> Result<Vec<HistoryItem>> {
        let result = self.call("history", json!([false])).await?;
        serde_json::from_value(result).map_err(|e| ClientError::decode(NAME, e.to_string()))
    }

    pub async fn config(&self) -> Result<Vec<ConfigEntry>> {
        let result = self.call("config", json!([])).await?;
        serde_json::from_value(result).map_err(|e| ClientError::decode(NAME, e.to_string()))
    }

    async fn edit_queue(&self, command: &str, id: i64) -> Result<()> {
        let result = self.call("editqueue", json!([command, "", [id]])).await?;
        if result == Value::Bool(false) {
            return Err(ClientError::rpc(
                NAME,
                "editqueue",
                format!("{command} failed for NZB {id}"),
            ));
        }
        Ok(())
    }

    /// Ensure `category` exists with the configured destination.
    ///
    /// Reads the full configuration, and when the category is missing or
    /// points elsewhere writes the full merged configuration back and
    /// reloads the daemon. Failures are logged, never returned.
    pub async fn ensure_category(&self, category: &str) {
        if let Err(e) = self.try_ensure_category(category).await {
            warn!(category = %category, error = %e, "Failed to ensure NZBGet category");
        }
    }

    async fn try_ensure_category(&self, category: &str) -> Result<()> {
        let config = self.config().await?;
        let desired = self.settings.remote_download_path();

        let merged = match plan_category(&config, category, &desired) {
            CategoryPlan::Unchanged => {
                debug!(category = %category, "NZBGet category already configured");
                return Ok(());
            }
            CategoryPlan::Write(merged) => merged,
        };

        let saved = self.call("saveconfig", json!([merged])).await?;
        if saved != Value::Bool(true) {
            return Err(ClientError::rpc(NAME, "saveconfig", "configuration was not saved"));
        }
        info!(category = %category, dest_dir = %desired, "Saved NZBGet category");

        self.call("reload", json!([])).await?;
        self.wait_until_responsive().await;
        Ok(())
    }

    async fn wait_until_responsive(&self) {
        let deadline = Instant::now() + self.reload_timeout;
        loop {
            if self.call("status", json!([])).await.is_ok() {
                debug!("NZBGet responsive after reload");
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    timeout_secs = self.reload_timeout.as_secs(),
                    "NZBGet did not respond after reload, continuing"
                );
                return;
            }
            tokio::time::sleep(self.reload_poll_interval).await;
        }
    }

    async fn find_existing(&self, payload: &NzbPayload) -> Result<Option<i64>> {
        let matches = |name: &str, filename: &str| {
            nzb_names_match(name, &payload.name)
                || nzb_names_match(&strip_nzb_extensions(filename), &payload.name)
        };

        if let Some(group) = self
            .groups()
            .await?
            .into_iter()
            .find(|g| matches(&g.nzb_name, &g.nzb_filename))
        {
            return Ok(Some(group.nzb_id));
        }

        Ok(self
            .history()
            .await?
            .into_iter()
            .find(|h| {
                matches(&h.name, &h.nzb_filename)
                    && map_history_status(&h.status) != DownloadStatus::Failed
            })
            .map(|h| h.nzb_id))
    }

    async fn download_rate(&self) -> u64 {
        match self.call("status", json!([])).await {
            Ok(status) => status
                .get("DownloadRate")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            Err(e) => {
                debug!(error = %e, "Failed to read NZBGet download rate");
                0
            }
        }
    }

    fn group_info(&self, group: Group, rate: u64) -> DownloadInfo {
        let status = map_queue_status(&group.status);
        let size = combine(group.file_size_lo, group.file_size_hi);
        let remaining = combine(group.remaining_size_lo, group.remaining_size_hi);
        let downloaded = size.saturating_sub(remaining);
        let progress = if size > 0 {
            downloaded as f64 / size as f64
        } else {
            0.0
        };

        DownloadInfo {
            id: group.nzb_id.to_string(),
            name: group.nzb_name,
            size,
            bytes_downloaded: downloaded,
            progress: clamp_progress(progress),
            status,
            download_speed: rate,
            eta: if rate > 0 { remaining / rate } else { 0 },
            category: group.category,
            download_path: (!group.dest_dir.is_empty())
                .then(|| self.settings.local_path(&group.dest_dir)),
            ..DownloadInfo::new("", "", DownloadStatus::Queued)
        }
    }

    fn history_info(&self, item: HistoryItem) -> DownloadInfo {
        let status = map_history_status(&item.status);
        let size = combine(item.file_size_lo, item.file_size_hi);
        let dir = if item.final_dir.is_empty() {
            item.dest_dir
        } else {
            item.final_dir
        };

        DownloadInfo {
            id: item.nzb_id.to_string(),
            name: item.name,
            size,
            bytes_downloaded: size,
            progress: 1.0,
            status,
            category: item.category,
            download_path: (!dir.is_empty()).then(|| self.settings.local_path(&dir)),
            completed_at: (item.history_time > 0)
                .then(|| DateTime::from_timestamp(item.history_time, 0))
                .flatten(),
            error_message: (status == DownloadStatus::Failed)
                .then(|| format!("NZBGet reported {}", item.status)),
            ..DownloadInfo::new("", "", DownloadStatus::Completed)
        }
    }
}

fn parse_id(client_id: &str) -> Option<i64> {
    client_id.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

fn invalid_id(client_id: &str) -> ClientError {
    ClientError::InvalidSource(format!("invalid NZBGet id '{client_id}'"))
}

#[async_trait]
impl DownloadClient for NzbgetClient {
    fn client_type(&self) -> ClientKind {
        ClientKind::Nzbget
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        match self.call("version", json!([])).await {
            Ok(version) => ConnectionTestResult::ok(NAME, version.as_str().unwrap_or("unknown")),
            Err(e) => ConnectionTestResult::failed(e.user_message()),
        }
    }

    async fn add_download(&self, source_url: &str, options: AddDownloadOptions) -> Result<String> {
        let payload = self.fetcher.fetch_nzb(source_url).await?;

        if let Some(existing) = self.find_existing(&payload).await? {
            info!(nzb_id = existing, name = %payload.name, "NZB already present in NZBGet");
            return Ok(existing.to_string());
        }

        let category = options
            .category
            .unwrap_or_else(|| self.settings.category.clone());
        self.ensure_category(&category).await;

        let params = json!([
            payload.filename(),
            BASE64.encode(&payload.data),
            category,
            priority_value(options.priority.unwrap_or_default()),
            false,
            options.paused.unwrap_or(false),
            "",
            0,
            "SCORE",
            []
        ]);

        let id = self
            .call("append", params)
            .await
            .map_err(|e| match e {
                ClientError::Rpc { message, .. } => ClientError::rejected(NAME, message),
                other => other,
            })?
            .as_i64()
            .unwrap_or(0);
        if id <= 0 {
            return Err(ClientError::rejected(
                NAME,
                format!("append returned {id} for {}", payload.filename()),
            ));
        }

        info!(nzb_id = id, name = %payload.name, "Added NZB to NZBGet");
        Ok(id.to_string())
    }

    async fn get_download(&self, client_id: &str) -> Result<Option<DownloadInfo>> {
        let Some(id) = parse_id(client_id) else {
            return Ok(None);
        };

        if let Some(group) = self.groups().await?.into_iter().find(|g| g.nzb_id == id) {
            let rate = if group.status == "DOWNLOADING" {
                self.download_rate().await
            } else {
                0
            };
            return Ok(Some(self.group_info(group, rate)));
        }

        Ok(self
            .history()
            .await?
            .into_iter()
            .find(|h| h.nzb_id == id)
            .map(|h| self.history_info(h)))
    }

    async fn pause_download(&self, client_id: &str) -> Result<()> {
        let id = parse_id(client_id).ok_or_else(|| invalid_id(client_id))?;
        self.edit_queue("GroupPause", id).await
    }

    async fn resume_download(&self, client_id: &str) -> Result<()> {
        let id = parse_id(client_id).ok_or_else(|| invalid_id(client_id))?;
        self.edit_queue("GroupResume", id).await
    }

    async fn delete_download(&self, client_id: &str, delete_files: bool) -> Result<()> {
        let id = parse_id(client_id).ok_or_else(|| invalid_id(client_id))?;
        let in_queue = self.groups().await?.iter().any(|g| g.nzb_id == id);
        let command = match (in_queue, delete_files) {
            (true, true) => "GroupFinalDelete",
            (true, false) => "GroupDelete",
            (false, true) => "HistoryFinalDelete",
            (false, false) => "HistoryDelete",
        };
        self.edit_queue(command, id).await
    }

    /// Hide the finished item from history.
    async fn post_process(&self, client_id: &str) -> Result<()> {
        let id = parse_id(client_id).ok_or_else(|| invalid_id(client_id))?;
        self.edit_queue("HistoryDelete", id).await
    }
}
