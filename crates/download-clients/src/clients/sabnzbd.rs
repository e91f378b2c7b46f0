//! SABnzbd API adapter.

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::http::build_client;
use crate::models::{
    AdapterSettings, AddDownloadOptions, ClientKind, ConnectionTestResult, DownloadInfo,
    DownloadPriority, DownloadStatus, clamp_progress,
};
use crate::path_mapping::paths_equal;
use crate::source::{NzbPayload, SourceFetcher, nzb_names_match};
use crate::traits::DownloadClient;

const NAME: &str = "SABnzbd";
const MIB: f64 = 1024.0 * 1024.0;

/// Accept numbers that SABnzbd sometimes encodes as strings.
fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64().unwrap_or_default(),
        Value::String(s) => s.trim().parse().unwrap_or_default(),
        _ => 0.0,
    })
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    queue: Queue,
}

#[derive(Debug, Deserialize)]
struct Queue {
    #[serde(default, deserialize_with = "lenient_f64")]
    kbpersec: f64,
    #[serde(default)]
    slots: Vec<QueueSlot>,
}

#[derive(Debug, Deserialize)]
struct QueueSlot {
    nzo_id: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    status: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    percentage: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    mb: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    mbleft: f64,
    #[serde(default)]
    cat: String,
    #[serde(default)]
    timeleft: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    history: History,
}

#[derive(Debug, Deserialize)]
struct History {
    #[serde(default)]
    slots: Vec<HistorySlot>,
}

#[derive(Debug, Deserialize)]
struct HistorySlot {
    nzo_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    bytes: f64,
    #[serde(default)]
    category: String,
    #[serde(default)]
    storage: String,
    #[serde(default)]
    completed: i64,
    #[serde(default)]
    fail_message: String,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    nzo_ids: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Category {
    name: String,
    #[serde(default)]
    dir: String,
}

/// Queue statuses: transfer states map directly, everything after the
/// transfer collapses to `processing`.
pub(crate) fn map_queue_status(status: &str) -> DownloadStatus {
    match status {
        "Queued" | "Grabbing" | "Fetching" | "Propagating" => DownloadStatus::Queued,
        "Downloading" => DownloadStatus::Downloading,
        "Paused" => DownloadStatus::Paused,
        "Checking" | "QuickCheck" | "Verifying" | "Repairing" | "Extracting" | "Moving"
        | "Running" => DownloadStatus::Processing,
        other => {
            warn!(status = %other, "Unknown SABnzbd queue status, treating as downloading");
            DownloadStatus::Downloading
        }
    }
}

pub(crate) fn map_history_status(status: &str) -> DownloadStatus {
    match status {
        "Completed" => DownloadStatus::Completed,
        "Failed" => DownloadStatus::Failed,
        "Queued" | "QuickCheck" | "Verifying" | "Repairing" | "Fetching" | "Extracting"
        | "Moving" | "Running" => DownloadStatus::Processing,
        other => {
            warn!(status = %other, "Unknown SABnzbd history status, treating as failed");
            DownloadStatus::Failed
        }
    }
}

/// Parse `H:MM:SS` (optionally prefixed with days) into seconds.
fn parse_timeleft(value: &str) -> u64 {
    value
        .split(':')
        .rev()
        .zip([1u64, 60, 3600, 86_400])
        .map(|(part, factor)| part.trim().parse::<u64>().unwrap_or(0) * factor)
        .sum()
}

fn priority_value(priority: DownloadPriority) -> &'static str {
    match priority {
        DownloadPriority::Low => "-1",
        DownloadPriority::Normal => "0",
        DownloadPriority::High => "1",
        DownloadPriority::Force => "2",
    }
}

/// SABnzbd adapter.
pub struct SabnzbdClient {
    http: reqwest::Client,
    fetcher: SourceFetcher,
    settings: AdapterSettings,
    api_url: String,
}

impl SabnzbdClient {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        let disable_ssl = settings.connection.disable_ssl_verify;
        let base = settings.connection.url.trim_end_matches('/');
        let api_url = if base.ends_with("/api") {
            base.to_string()
        } else {
            format!("{base}/api")
        };
        Ok(Self {
            http: build_client(disable_ssl)?,
            fetcher: SourceFetcher::new(NAME, disable_ssl)?,
            api_url,
            settings,
        })
    }

    fn base_query<'a>(&'a self, mode: &'a str) -> Vec<(&'a str, &'a str)> {
        vec![
            ("mode", mode),
            ("apikey", self.settings.connection.auth.secret().unwrap_or_default()),
            ("output", "json"),
        ]
    }

    async fn read_json(&self, mode: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ClientError::from_status(NAME, status.as_u16(), text));
        }

        let value: Value =
            serde_json::from_str(&text).map_err(|e| ClientError::decode(NAME, e.to_string()))?;

        if value.get("status").and_then(Value::as_bool) == Some(false)
            && let Some(error) = value.get("error").and_then(Value::as_str)
        {
            if error.to_ascii_lowercase().contains("api key") {
                return Err(ClientError::Auth {
                    client: NAME,
                    message: error.to_string(),
                });
            }
            return Err(ClientError::rpc(NAME, mode, error));
        }
        Ok(value)
    }

    async fn get(&self, mode: &str, extra: &[(&str, &str)]) -> Result<Value> {
        let mut query = self.base_query(mode);
        query.extend_from_slice(extra);
        let response = self
            .http
            .get(&self.api_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(NAME, &self.api_url, e))?;
        self.read_json(mode, response).await
    }

    async fn queue(&self, nzo_id: Option<&str>) -> Result<Queue> {
        let extra: Vec<(&str, &str)> = nzo_id.map(|id| vec![("nzo_ids", id)]).unwrap_or_default();
        let value = self.get("queue", &extra).await?;
        serde_json::from_value::<QueueResponse>(value)
            .map(|r| r.queue)
            .map_err(|e| ClientError::decode(NAME, e.to_string()))
    }

    async fn history(&self, nzo_id: Option<&str>) -> Result<History> {
        let extra: Vec<(&str, &str)> = nzo_id.map(|id| vec![("nzo_ids", id)]).unwrap_or_default();
        let value = self.get("history", &extra).await?;
        serde_json::from_value::<HistoryResponse>(value)
            .map(|r| r.history)
            .map_err(|e| ClientError::decode(NAME, e.to_string()))
    }

    /// Look for an item whose name matches the NZB being added.
    async fn find_existing(&self, payload: &NzbPayload) -> Result<Option<String>> {
        let queue = self.queue(None).await?;
        if let Some(slot) = queue
            .slots
            .iter()
            .find(|slot| nzb_names_match(&slot.filename, &payload.name))
        {
            return Ok(Some(slot.nzo_id.clone()));
        }

        let history = self.history(None).await?;
        Ok(history
            .slots
            .iter()
            .find(|slot| {
                nzb_names_match(&slot.name, &payload.name)
                    && map_history_status(&slot.status) != DownloadStatus::Failed
            })
            .map(|slot| slot.nzo_id.clone()))
    }

    /// Ensure the category exists and points at the configured directory.
    /// Failures are logged, never returned.
    pub async fn ensure_category(&self, category: &str) {
        if let Err(e) = self.try_ensure_category(category).await {
            warn!(category = %category, error = %e, "Failed to ensure SABnzbd category");
        }
    }

    async fn try_ensure_category(&self, category: &str) -> Result<()> {
        let desired = self.settings.remote_download_path();
        let config = self.get("get_config", &[("section", "categories")]).await?;
        let categories: Vec<Category> = config
            .pointer("/config/categories")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ClientError::decode(NAME, e.to_string()))?
            .unwrap_or_default();

        if categories
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(category) && paths_equal(&c.dir, &desired))
        {
            return Ok(());
        }

        self.get(
            "set_config",
            &[
                ("section", "categories"),
                ("keyword", category),
                ("dir", desired.as_str()),
            ],
        )
        .await?;
        info!(category = %category, dir = %desired, "Configured SABnzbd category");
        Ok(())
    }

    fn queue_info(&self, slot: QueueSlot, speed_kb: f64) -> DownloadInfo {
        let status = map_queue_status(&slot.status);
        let size = (slot.mb * MIB).max(0.0) as u64;
        let left = (slot.mbleft * MIB).max(0.0) as u64;

        DownloadInfo {
            id: slot.nzo_id,
            size,
            bytes_downloaded: size.saturating_sub(left),
            progress: clamp_progress(slot.percentage / 100.0),
            download_speed: if status == DownloadStatus::Downloading {
                (speed_kb * 1024.0).max(0.0) as u64
            } else {
                0
            },
            eta: parse_timeleft(&slot.timeleft),
            category: slot.cat,
            name: slot.filename,
            status,
            ..DownloadInfo::new("", "", DownloadStatus::Queued)
        }
    }

    fn history_info(&self, slot: HistorySlot) -> DownloadInfo {
        let status = map_history_status(&slot.status);
        let size = slot.bytes.max(0.0) as u64;

        DownloadInfo {
            id: slot.nzo_id,
            size,
            bytes_downloaded: size,
            progress: 1.0,
            category: slot.category,
            download_path: (!slot.storage.is_empty())
                .then(|| self.settings.local_path(&slot.storage)),
            completed_at: (slot.completed > 0)
                .then(|| DateTime::from_timestamp(slot.completed, 0))
                .flatten(),
            error_message: (status == DownloadStatus::Failed && !slot.fail_message.is_empty())
                .then_some(slot.fail_message),
            name: slot.name,
            status,
            ..DownloadInfo::new("", "", DownloadStatus::Completed)
        }
    }
}

#[async_trait]
impl DownloadClient for SabnzbdClient {
    fn client_type(&self) -> ClientKind {
        ClientKind::Sabnzbd
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        // `version` does not check the key, so follow with an authenticated call.
        let version = match self.get("version", &[]).await {
            Ok(value) => value
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            Err(e) => return ConnectionTestResult::failed(e.user_message()),
        };
        match self.queue(None).await {
            Ok(_) => ConnectionTestResult::ok(NAME, version),
            Err(e) => ConnectionTestResult::failed(e.user_message()),
        }
    }

    async fn add_download(&self, source_url: &str, options: AddDownloadOptions) -> Result<String> {
        let payload = self.fetcher.fetch_nzb(source_url).await?;

        if let Some(existing) = self.find_existing(&payload).await? {
            info!(nzo_id = %existing, name = %payload.name, "NZB already present in SABnzbd");
            return Ok(existing);
        }

        let category = options
            .category
            .unwrap_or_else(|| self.settings.category.clone());
        self.ensure_category(&category).await;

        let mut query = self.base_query("addfile");
        query.push(("cat", category.as_str()));
        query.push(("nzbname", payload.name.as_str()));
        // SABnzbd models "paused" as a priority.
        let priority = if options.paused == Some(true) {
            "-2"
        } else {
            priority_value(options.priority.unwrap_or_default())
        };
        query.push(("priority", priority));

        let part = Part::bytes(payload.data.clone())
            .file_name(payload.filename())
            .mime_str("application/x-nzb")
            .map_err(|e| ClientError::InvalidSource(e.to_string()))?;
        let form = Form::new().part("name", part);

        let response = self
            .http
            .post(&self.api_url)
            .query(&query)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(NAME, &self.api_url, e))?;
        let value = self.read_json("addfile", response).await.map_err(|e| match e {
            ClientError::Rpc { message, .. } => ClientError::rejected(NAME, message),
            other => other,
        })?;

        let added: AddResponse =
            serde_json::from_value(value).map_err(|e| ClientError::decode(NAME, e.to_string()))?;
        let nzo_id = added
            .nzo_ids
            .into_iter()
            .next()
            .filter(|_| added.status)
            .ok_or_else(|| {
                ClientError::rejected(
                    NAME,
                    added
                        .error
                        .unwrap_or_else(|| "no nzo_id returned".to_string()),
                )
            })?;

        info!(nzo_id = %nzo_id, name = %payload.name, "Added NZB to SABnzbd");
        Ok(nzo_id)
    }

    async fn get_download(&self, client_id: &str) -> Result<Option<DownloadInfo>> {
        let id = client_id.trim();
        if id.is_empty() || id.contains(char::is_whitespace) {
            return Ok(None);
        }

        let queue = self.queue(Some(id)).await?;
        let speed = queue.kbpersec;
        if let Some(slot) = queue.slots.into_iter().find(|s| s.nzo_id == id) {
            return Ok(Some(self.queue_info(slot, speed)));
        }

        let history = self.history(Some(id)).await?;
        Ok(history
            .slots
            .into_iter()
            .find(|s| s.nzo_id == id)
            .map(|slot| self.history_info(slot)))
    }

    async fn pause_download(&self, client_id: &str) -> Result<()> {
        self.get("queue", &[("name", "pause"), ("value", client_id)])
            .await
            .map(|_| ())
    }

    async fn resume_download(&self, client_id: &str) -> Result<()> {
        self.get("queue", &[("name", "resume"), ("value", client_id)])
            .await
            .map(|_| ())
    }

    async fn delete_download(&self, client_id: &str, delete_files: bool) -> Result<()> {
        let del_files = if delete_files { "1" } else { "0" };
        self.get(
            "queue",
            &[("name", "delete"), ("value", client_id), ("del_files", del_files)],
        )
        .await?;
        self.get(
            "history",
            &[("name", "delete"), ("value", client_id), ("del_files", del_files)],
        )
        .await?;
        Ok(())
    }

    /// Move the finished job into the history archive.
    async fn post_process(&self, client_id: &str) -> Result<()> {
        self.get("history", &[("name", "archive"), ("value", client_id)])
            .await?;
        debug!(nzo_id = %client_id, "Archived SABnzbd history entry");
        Ok(())
    }
}
