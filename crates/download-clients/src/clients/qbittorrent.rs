//! qBittorrent Web API v2 adapter.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::StatusCode;
use reqwest::header::{COOKIE, REFERER, SET_COOKIE};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
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

const NAME: &str = "qBittorrent";

/// qBittorrent reports this ETA for "infinite".
const ETA_INFINITY: i64 = 8_640_000;

#[derive(Debug, Clone, Deserialize)]
struct TorrentInfo {
    hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    total_size: i64,
    #[serde(default)]
    downloaded: i64,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    dlspeed: i64,
    #[serde(default)]
    eta: i64,
    #[serde(default)]
    state: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    save_path: String,
    #[serde(default)]
    content_path: String,
    #[serde(default)]
    completion_on: i64,
    #[serde(default)]
    seeding_time: i64,
    #[serde(default)]
    ratio: f64,
}

#[derive(Debug, Deserialize)]
struct Category {
    #[serde(rename = "savePath", default)]
    save_path: String,
}

/// Map a qBittorrent torrent state onto the normalized status.
pub(crate) fn map_state(state: &str, progress: f64) -> DownloadStatus {
    match state {
        "error" | "missingFiles" => DownloadStatus::Failed,
        "pausedDL" | "stoppedDL" => {
            if progress >= 1.0 {
                DownloadStatus::Completed
            } else {
                DownloadStatus::Paused
            }
        }
        "pausedUP" | "stoppedUP" => DownloadStatus::Completed,
        "queuedDL" => DownloadStatus::Queued,
        "checkingDL" | "checkingUP" | "checkingResumeData" => DownloadStatus::Checking,
        "downloading" | "metaDL" | "forcedMetaDL" | "forcedDL" | "stalledDL" | "allocating" => {
            DownloadStatus::Downloading
        }
        "uploading" | "stalledUP" | "forcedUP" | "queuedUP" => DownloadStatus::Seeding,
        "moving" => DownloadStatus::Processing,
        other => {
            warn!(state = %other, "Unknown qBittorrent state, treating as downloading");
            DownloadStatus::Downloading
        }
    }
}

/// qBittorrent adapter.
///
/// Holds the session cookie obtained from `/auth/login`; a 403 triggers
/// exactly one re-login and one retry.
pub struct QbittorrentClient {
    http: reqwest::Client,
    fetcher: SourceFetcher,
    settings: AdapterSettings,
    base_url: String,
    /// `name=value` cookie pair, empty when the WebUI bypasses auth.
    session: RwLock<Option<String>>,
    login_lock: Mutex<()>,
}

impl QbittorrentClient {
    pub fn new(settings: AdapterSettings) -> Result<Self> {
        let disable_ssl = settings.connection.disable_ssl_verify;
        Ok(Self {
            http: build_client(disable_ssl)?,
            fetcher: SourceFetcher::new(NAME, disable_ssl)?,
            base_url: settings.connection.url.trim_end_matches('/').to_string(),
            settings,
            session: RwLock::new(None),
            login_lock: Mutex::new(()),
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v2{}", self.base_url, path)
    }

    async fn login(&self) -> Result<String> {
        let auth = &self.settings.connection.auth;
        let params = [
            ("username", auth.username().unwrap_or_default()),
            ("password", auth.secret().unwrap_or_default()),
        ];

        let url = self.api("/auth/login");
        let response = self
            .http
            .post(&url)
            .header(REFERER, &self.base_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(NAME, &self.base_url, e))?;

        let status = response.status();
        let cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .find(|pair| {
                pair.split_once('=')
                    .is_some_and(|(name, _)| name.trim().ends_with("SID"))
            })
            .map(|pair| pair.trim().to_string());

        let body = response.text().await.unwrap_or_default();

        if status.is_success() && body.trim() == "Ok." {
            debug!("Logged in to qBittorrent");
            return Ok(cookie.unwrap_or_default());
        }

        if body.trim() == "Fails." {
            return Err(ClientError::Auth {
                client: NAME,
                message: "invalid username or password".to_string(),
            });
        }

        Err(ClientError::from_status(NAME, status.as_u16(), body))
    }

    async fn session(&self) -> Result<String> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }
        self.refresh_session(None).await
    }

    /// Re-authenticate, coalescing concurrent refreshes into one login.
    async fn refresh_session(&self, stale: Option<&str>) -> Result<String> {
        let _guard = self.login_lock.lock().await;

        if let Some(current) = self.session.read().await.clone()
            && Some(current.as_str()) != stale
        {
            return Ok(current);
        }

        let session = self.login().await?;
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    async fn dispatch<F>(&self, build: &F, session: &str) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut request = build(&self.http).header(REFERER, &self.base_url);
        if !session.is_empty() {
            request = request.header(COOKIE, session);
        }
        request
            .send()
            .await
            .map_err(|e| ClientError::from_reqwest(NAME, &self.base_url, e))
    }

    /// Send an authenticated request, re-logging in once on 403.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let session = self.session().await?;
        let response = self.dispatch(&build, &session).await?;
        if response.status() != StatusCode::FORBIDDEN {
            return Ok(response);
        }

        debug!("qBittorrent session rejected, re-authenticating");
        let session = self.refresh_session(Some(&session)).await?;
        let response = self.dispatch(&build, &session).await?;
        if response.status() == StatusCode::FORBIDDEN {
            return Err(ClientError::from_status(NAME, 403, ""));
        }
        Ok(response)
    }

    async fn expect_success(response: reqwest::Response) -> Result<String> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(body)
        } else {
            Err(ClientError::from_status(NAME, status.as_u16(), body))
        }
    }

    async fn version(&self) -> Result<String> {
        let url = self.api("/app/version");
        let response = self.send(|http| http.get(&url)).await?;
        Ok(Self::expect_success(response).await?.trim().to_string())
    }

    async fn torrent(&self, hash: &str) -> Result<Option<TorrentInfo>> {
        let url = self.api("/torrents/info");
        let response = self
            .send(|http| http.get(&url).query(&[("hashes", hash)]))
            .await?;
        let body = Self::expect_success(response).await?;
        let torrents: Vec<TorrentInfo> =
            serde_json::from_str(&body).map_err(|e| ClientError::decode(NAME, e.to_string()))?;
        Ok(torrents
            .into_iter()
            .find(|t| t.hash.eq_ignore_ascii_case(hash)))
    }

    /// Create or update the category so its save path matches the
    /// configured download directory. Failures are logged, never returned.
    pub async fn ensure_category(&self, category: &str) {
        if let Err(e) = self.try_ensure_category(category).await {
            warn!(category = %category, error = %e, "Failed to ensure qBittorrent category");
        }
    }

    async fn try_ensure_category(&self, category: &str) -> Result<()> {
        let desired = self.settings.remote_download_path();

        let url = self.api("/torrents/categories");
        let response = self.send(|http| http.get(&url)).await?;
        let body = Self::expect_success(response).await?;
        let categories: HashMap<String, Category> =
            serde_json::from_str(&body).map_err(|e| ClientError::decode(NAME, e.to_string()))?;

        let endpoint = match categories.get(category) {
            Some(existing) if paths_equal(&existing.save_path, &desired) => return Ok(()),
            Some(_) => "/torrents/editCategory",
            None => "/torrents/createCategory",
        };

        let url = self.api(endpoint);
        let params = [("category", category), ("savePath", desired.as_str())];
        let response = self.send(|http| http.post(&url).form(&params)).await?;
        Self::expect_success(response).await?;
        info!(category = %category, save_path = %desired, "Configured qBittorrent category");
        Ok(())
    }

    /// POST to `primary`, falling back to the v5 name on 404.
    async fn post_hashes(&self, primary: &str, fallback: &str, hash: &str) -> Result<()> {
        let url = self.api(primary);
        let params = [("hashes", hash)];
        let response = self.send(|http| http.post(&url).form(&params)).await?;
        if response.status() != StatusCode::NOT_FOUND {
            Self::expect_success(response).await?;
            return Ok(());
        }

        let url = self.api(fallback);
        let response = self.send(|http| http.post(&url).form(&params)).await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    fn to_download_info(&self, torrent: TorrentInfo) -> DownloadInfo {
        let progress = clamp_progress(torrent.progress);
        let status = map_state(&torrent.state, progress);
        let size = if torrent.size > 0 {
            torrent.size
        } else {
            torrent.total_size
        };

        let remote_path = if !torrent.content_path.is_empty() {
            Some(torrent.content_path.clone())
        } else if !torrent.save_path.is_empty() {
            Some(format!(
                "{}/{}",
                torrent.save_path.trim_end_matches(['/', '\\']),
                torrent.name
            ))
        } else {
            None
        };

        DownloadInfo {
            id: torrent.hash.to_ascii_lowercase(),
            size: size.max(0) as u64,
            bytes_downloaded: torrent.downloaded.max(0) as u64,
            progress,
            download_speed: torrent.dlspeed.max(0) as u64,
            eta: if torrent.eta >= ETA_INFINITY {
                0
            } else {
                torrent.eta.max(0) as u64
            },
            category: torrent.category,
            download_path: remote_path.map(|p| self.settings.local_path(&p)),
            completed_at: (torrent.completion_on > 0)
                .then(|| DateTime::from_timestamp(torrent.completion_on, 0))
                .flatten(),
            error_message: (status == DownloadStatus::Failed)
                .then(|| format!("qBittorrent reported state '{}'", torrent.state)),
            seeding_time: Some(torrent.seeding_time.max(0) as u64),
            ratio: Some(torrent.ratio),
            name: torrent.name,
            status,
        }
    }
}

#[async_trait]
impl DownloadClient for QbittorrentClient {
    fn client_type(&self) -> ClientKind {
        ClientKind::Qbittorrent
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        match self.version().await {
            Ok(version) => ConnectionTestResult::ok(NAME, version),
            Err(e) => ConnectionTestResult::failed(e.user_message()),
        }
    }

    async fn add_download(&self, source_url: &str, options: AddDownloadOptions) -> Result<String> {
        let source = self.fetcher.resolve_torrent(source_url).await?;
        let hash = source.info_hash().to_string();

        if self.torrent(&hash).await?.is_some() {
            info!(hash = %hash, "Torrent already present in qBittorrent");
            return Ok(hash);
        }

        let category = options
            .category
            .unwrap_or_else(|| self.settings.category.clone());
        self.ensure_category(&category).await;

        let save_path = self.settings.remote_download_path();
        let paused = options.paused.unwrap_or(false).to_string();

        let url = self.api("/torrents/add");
        let response = self
            .send(|http| {
                let form = match &source {
                    TorrentSource::Magnet { uri, .. } => Form::new().text("urls", uri.clone()),
                    TorrentSource::File { data, filename, .. } => Form::new().part(
                        "torrents",
                        Part::bytes(data.clone()).file_name(filename.clone()),
                    ),
                };
                let form = form
                    .text("category", category.clone())
                    .text("savepath", save_path.clone())
                    .text("paused", paused.clone())
                    .text("stopped", paused.clone());
                http.post(&url).multipart(form)
            })
            .await?;

        if response.status() == StatusCode::UNSUPPORTED_MEDIA_TYPE {
            return Err(ClientError::rejected(NAME, "torrent file is not valid"));
        }
        let body = Self::expect_success(response).await?;
        if body.trim() == "Fails." {
            return Err(ClientError::rejected(NAME, "torrent could not be added"));
        }

        info!(hash = %hash, category = %category, "Added torrent to qBittorrent");
        Ok(hash)
    }

    async fn get_download(&self, client_id: &str) -> Result<Option<DownloadInfo>> {
        if !is_info_hash(client_id) {
            return Ok(None);
        }
        let torrent = self.torrent(&client_id.to_ascii_lowercase()).await?;
        Ok(torrent.map(|t| self.to_download_info(t)))
    }

    async fn pause_download(&self, client_id: &str) -> Result<()> {
        self.post_hashes("/torrents/pause", "/torrents/stop", client_id)
            .await
    }

    async fn resume_download(&self, client_id: &str) -> Result<()> {
        self.post_hashes("/torrents/resume", "/torrents/start", client_id)
            .await
    }

    async fn delete_download(&self, client_id: &str, delete_files: bool) -> Result<()> {
        let url = self.api("/torrents/delete");
        let delete_files = delete_files.to_string();
        let params = [("hashes", client_id), ("deleteFiles", delete_files.as_str())];
        let response = self.send(|http| http.post(&url).form(&params)).await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn post_process(&self, _client_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClientAuth, ClientConnection};
    use wiremock::matchers::{any, body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HASH: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    fn client(server: &MockServer) -> QbittorrentClient {
        QbittorrentClient::new(AdapterSettings {
            connection: ClientConnection {
                url: server.uri(),
                auth: ClientAuth::Credentials {
                    username: "admin".into(),
                    password: "secret".into(),
                },
                disable_ssl_verify: false,
            },
            path_mapping: None,
            category: "readmeabook".into(),
            download_path: "/downloads".into(),
        })
        .unwrap()
    }

    async fn mount_login(server: &MockServer, expected: u64) {
        Mock::given(method("POST"))
            .and(path("/api/v2/auth/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "SID=abc123; HttpOnly; path=/")
                    .set_body_string("Ok."),
            )
            .expect(expected)
            .mount(server)
            .await;
    }

    fn torrent_json(state: &str, progress: f64) -> serde_json::Value {
        serde_json::json!([{
            "hash": HASH,
            "name": "Book",
            "size": 1000,
            "downloaded": 500,
            "progress": progress,
            "dlspeed": 10,
            "eta": ETA_INFINITY,
            "state": state,
            "category": "readmeabook",
            "save_path": "/downloads",
            "content_path": "/downloads/Book",
            "completion_on": -1,
            "seeding_time": 0,
            "ratio": 0.0
        }])
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(map_state("error", 0.5), DownloadStatus::Failed);
        assert_eq!(map_state("missingFiles", 1.0), DownloadStatus::Failed);
        assert_eq!(map_state("pausedDL", 0.3), DownloadStatus::Paused);
        assert_eq!(map_state("stoppedDL", 1.0), DownloadStatus::Completed);
        assert_eq!(map_state("pausedUP", 1.0), DownloadStatus::Completed);
        assert_eq!(map_state("queuedDL", 0.0), DownloadStatus::Queued);
        assert_eq!(map_state("checkingResumeData", 0.0), DownloadStatus::Checking);
        assert_eq!(map_state("stalledDL", 0.1), DownloadStatus::Downloading);
        assert_eq!(map_state("stalledUP", 1.0), DownloadStatus::Seeding);
        assert_eq!(map_state("moving", 1.0), DownloadStatus::Processing);
        assert_eq!(map_state("somethingNew", 0.0), DownloadStatus::Downloading);
    }

    #[tokio::test]
    async fn test_connection_reports_version() {
        let server = MockServer::start().await;
        mount_login(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/api/v2/app/version"))
            .and(header("cookie", "SID=abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_string("v4.6.2"))
            .mount(&server)
            .await;

        let result = client(&server).test_connection().await;
        assert!(result.success);
        assert_eq!(result.version.as_deref(), Some("v4.6.2"));
    }

    #[tokio::test]
    async fn test_bad_credentials_fail_test_connection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Fails."))
            .mount(&server)
            .await;

        let result = client(&server).test_connection().await;
        assert!(!result.success);
        assert!(result.message.contains("username and password"));
    }

    #[tokio::test]
    async fn test_forbidden_relogs_once_and_retries() {
        let server = MockServer::start().await;
        mount_login(&server, 2).await;
        Mock::given(method("GET"))
            .and(path("/api/v2/torrents/info"))
            .respond_with(ResponseTemplate::new(403))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/torrents/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(torrent_json("uploading", 1.0)))
            .mount(&server)
            .await;

        let info = client(&server).get_download(HASH).await.unwrap().unwrap();
        assert_eq!(info.status, DownloadStatus::Seeding);
        assert_eq!(info.eta, 0);
        assert_eq!(info.download_path.as_deref(), Some("/downloads/Book"));
    }

    #[tokio::test]
    async fn test_persistent_forbidden_does_not_loop() {
        let server = MockServer::start().await;
        mount_login(&server, 2).await;
        Mock::given(method("GET"))
            .and(path("/api/v2/torrents/info"))
            .respond_with(ResponseTemplate::new(403))
            .expect(2)
            .mount(&server)
            .await;

        let err = client(&server).get_download(HASH).await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_invalid_id_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let qb = client(&server);
        assert!(qb.get_download("").await.unwrap().is_none());
        assert!(qb.get_download("not-a-hash").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_torrent_returns_none() {
        let server = MockServer::start().await;
        mount_login(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/api/v2/torrents/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        assert!(client(&server).get_download(HASH).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_magnet_is_not_re_added() {
        let server = MockServer::start().await;
        mount_login(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/api/v2/torrents/info"))
            .and(query_param("hashes", HASH))
            .respond_with(ResponseTemplate::new(200).set_body_json(torrent_json("downloading", 0.2)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/torrents/add"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Ok."))
            .expect(0)
            .mount(&server)
            .await;

        let qb = client(&server);
        let magnet = format!("magnet:?xt=urn:btih:{}", HASH.to_uppercase());
        let first = qb.add_download(&magnet, AddDownloadOptions::default()).await.unwrap();
        let second = qb.add_download(&magnet, AddDownloadOptions::default()).await.unwrap();
        assert_eq!(first, HASH);
        assert_eq!(second, HASH);
    }

    #[tokio::test]
    async fn test_add_magnet_creates_category() {
        let server = MockServer::start().await;
        mount_login(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/api/v2/torrents/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/torrents/categories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/torrents/createCategory"))
            .and(body_string_contains("category=readmeabook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/torrents/add"))
            .and(body_string_contains(HASH))
            .respond_with(ResponseTemplate::new(200).set_body_string("Ok."))
            .expect(1)
            .mount(&server)
            .await;

        let id = client(&server)
            .add_download(
                &format!("magnet:?xt=urn:btih:{HASH}"),
                AddDownloadOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(id, HASH);
    }

    #[tokio::test]
    async fn test_pause_falls_back_to_stop() {
        let server = MockServer::start().await;
        mount_login(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/api/v2/torrents/pause"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/torrents/stop"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).pause_download(HASH).await.unwrap();
    }
}
