//! Download client manager.
//!
//! Resolves which configured client serves a protocol, caches live adapters
//! by config id and migrates the legacy single-client settings.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use download_clients::{
    ClientKind, ClientService, ConnectionTestResult, DownloadClient, DownloadClientConfig,
    Protocol, StoredClientConfig,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::Result;
use crate::config::{DEFAULT_DOWNLOAD_DIR, DOWNLOAD_CLIENTS_KEY, DOWNLOAD_DIR_KEY, legacy};
use crate::database::repositories::SettingsRepository;

pub struct DownloadClientManager {
    settings: Arc<dyn SettingsRepository>,
    /// Validated configurations, loaded lazily.
    configs: RwLock<Option<Arc<Vec<DownloadClientConfig>>>>,
    /// Live adapters keyed by config id.
    services: DashMap<String, Arc<ClientService>>,
    /// Set once the legacy migration check ran in this process.
    migration_checked: AtomicBool,
}

impl DownloadClientManager {
    pub fn new(settings: Arc<dyn SettingsRepository>) -> Self {
        Self {
            settings,
            configs: RwLock::new(None),
            services: DashMap::new(),
            migration_checked: AtomicBool::new(false),
        }
    }

    /// All configured clients, enabled or not.
    pub async fn get_all_clients(&self) -> Result<Arc<Vec<DownloadClientConfig>>> {
        if let Some(configs) = self.configs.read().await.as_ref() {
            return Ok(configs.clone());
        }

        let mut guard = self.configs.write().await;
        if let Some(configs) = guard.as_ref() {
            return Ok(configs.clone());
        }

        self.migrate_legacy_config().await;

        let configs = Arc::new(self.load_configs().await?);
        debug!(count = configs.len(), "Loaded download client configurations");
        *guard = Some(configs.clone());
        Ok(configs)
    }

    pub async fn get_enabled_clients(&self) -> Result<Vec<DownloadClientConfig>> {
        Ok(self
            .get_all_clients()
            .await?
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .collect())
    }

    /// First enabled client serving `protocol`.
    pub async fn get_client_for_protocol(
        &self,
        protocol: Protocol,
    ) -> Result<Option<DownloadClientConfig>> {
        let found = self
            .get_all_clients()
            .await?
            .iter()
            .find(|c| c.enabled && c.protocol() == protocol)
            .cloned();

        if found.is_none() {
            warn!(%protocol, "No enabled download client configured for protocol");
        }
        Ok(found)
    }

    pub async fn has_client_for_protocol(&self, protocol: Protocol) -> Result<bool> {
        Ok(self
            .get_all_clients()
            .await?
            .iter()
            .any(|c| c.enabled && c.protocol() == protocol))
    }

    /// Live adapter for the client serving `protocol`.
    pub async fn get_client_service_for_protocol(
        &self,
        protocol: Protocol,
    ) -> Result<Option<(DownloadClientConfig, Arc<ClientService>)>> {
        let Some(config) = self.get_client_for_protocol(protocol).await? else {
            return Ok(None);
        };
        let service = self.cached_service(&config).await?;
        Ok(Some((config, service)))
    }

    /// Live adapter for a specific config id.
    pub async fn get_client_service(&self, config_id: &str) -> Result<Option<Arc<ClientService>>> {
        let Some(config) = self
            .get_all_clients()
            .await?
            .iter()
            .find(|c| c.id == config_id)
            .cloned()
        else {
            return Ok(None);
        };
        Ok(Some(self.cached_service(&config).await?))
    }

    /// Single factory over client kinds.
    pub async fn create_service(&self, config: &DownloadClientConfig) -> Result<ClientService> {
        let download_path = self.download_path_for(config).await?;
        Ok(ClientService::from_config(config, download_path)?)
    }

    /// Test a configuration with a fresh adapter; the cache is never touched.
    pub async fn test_connection(&self, config: &DownloadClientConfig) -> ConnectionTestResult {
        match self.create_service(config).await {
            Ok(service) => service.test_connection().await,
            Err(e) => ConnectionTestResult::failed(e.user_message()),
        }
    }

    /// Drop cached configurations and adapters.
    ///
    /// Also re-arms the legacy migration check for the next load.
    pub async fn invalidate(&self) {
        *self.configs.write().await = None;
        self.services.clear();
        self.migration_checked.store(false, Ordering::SeqCst);
        debug!("Download client cache invalidated");
    }

    /// Base download directory (`download_dir` setting).
    pub async fn download_dir(&self) -> Result<String> {
        Ok(self
            .settings
            .get_setting(DOWNLOAD_DIR_KEY)
            .await?
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_DOWNLOAD_DIR.to_string()))
    }

    /// Local destination for a client: `download_dir` joined with `customPath`.
    pub async fn download_path_for(&self, config: &DownloadClientConfig) -> Result<String> {
        let base = self.download_dir().await?;
        Ok(match config.custom_path.as_deref() {
            Some(custom) if Path::new(custom).is_absolute() => custom.to_string(),
            Some(custom) => Path::new(&base)
                .join(custom.trim_start_matches("./"))
                .to_string_lossy()
                .into_owned(),
            None => base,
        })
    }

    async fn cached_service(&self, config: &DownloadClientConfig) -> Result<Arc<ClientService>> {
        if let Some(service) = self.services.get(&config.id) {
            return Ok(service.clone());
        }

        let service = Arc::new(self.create_service(config).await?);
        // Another caller may have raced us; keep whichever landed first.
        let entry = self
            .services
            .entry(config.id.clone())
            .or_insert_with(|| service.clone());
        info!(client = %config.name, kind = %config.kind, "Download client service created");
        Ok(entry.clone())
    }

    async fn load_configs(&self) -> Result<Vec<DownloadClientConfig>> {
        let Some(raw) = self.settings.get_setting(DOWNLOAD_CLIENTS_KEY).await? else {
            return Ok(Vec::new());
        };
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        let stored: Vec<StoredClientConfig> = serde_json::from_str(&raw)?;
        let mut configs = Vec::with_capacity(stored.len());
        for entry in stored {
            match entry.validate() {
                Ok(config) => configs.push(config),
                Err(e) => warn!(id = %entry.id, error = %e, "Skipping invalid download client"),
            }
        }
        Ok(configs)
    }

    /// Move the flat legacy keys into `download_clients`, at most once per
    /// process lifetime (until [`invalidate`](Self::invalidate)).
    async fn migrate_legacy_config(&self) {
        if self.migration_checked.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.try_migrate_legacy().await {
            Ok(true) => info!("Migrated legacy download client settings to download_clients"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Legacy download client migration failed"),
        }
    }

    async fn try_migrate_legacy(&self) -> Result<bool> {
        let existing = self.settings.get_setting(DOWNLOAD_CLIENTS_KEY).await?;
        if let Some(raw) = existing.as_deref()
            && let Ok(list) = serde_json::from_str::<Vec<serde_json::Value>>(raw)
            && !list.is_empty()
        {
            return Ok(false);
        }

        let get = |key: &'static str| async move {
            self.settings
                .get_setting(key)
                .await
                .map(|v| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
        };

        let (Some(client_type), Some(url)) = (get(legacy::TYPE).await?, get(legacy::URL).await?)
        else {
            return Ok(false);
        };

        let kind: ClientKind = client_type.to_ascii_lowercase().parse().map_err(|_| {
            crate::Error::config(format!("unsupported legacy client type '{client_type}'"))
        })?;

        let flag = |value: Option<String>| value.is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let stored = StoredClientConfig {
            id: uuid::Uuid::new_v4().to_string(),
            client_type: kind.as_str().to_string(),
            name: kind.display_name().to_string(),
            enabled: true,
            url,
            username: get(legacy::USERNAME).await?,
            password: get(legacy::PASSWORD).await?,
            disable_ssl_verify: flag(get(legacy::DISABLE_SSL_VERIFY).await?),
            remote_path_mapping_enabled: flag(get(legacy::REMOTE_PATH_MAPPING_ENABLED).await?),
            remote_path: get(legacy::REMOTE_PATH).await?,
            local_path: get(legacy::LOCAL_PATH).await?,
            category: None,
            custom_path: None,
        };

        let json = serde_json::to_string(&vec![stored])?;
        self.settings.set_setting(DOWNLOAD_CLIENTS_KEY, &json).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySettings;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn clients_json(entries: &[serde_json::Value]) -> String {
        serde_json::to_string(entries).unwrap()
    }

    fn manager(settings: &Arc<MemorySettings>) -> DownloadClientManager {
        DownloadClientManager::new(settings.clone())
    }

    #[tokio::test]
    async fn test_first_enabled_client_per_protocol() {
        let settings = Arc::new(MemorySettings::default());
        settings.insert(
            DOWNLOAD_CLIENTS_KEY,
            clients_json(&[
                serde_json::json!({"id":"a","type":"qbittorrent","url":"http://a","enabled":false}),
                serde_json::json!({"id":"b","type":"transmission","url":"http://b"}),
                serde_json::json!({"id":"c","type":"deluge","url":"http://c"}),
                serde_json::json!({"id":"d","type":"sabnzbd","url":"http://d","password":"key"}),
            ]),
        );
        let manager = manager(&settings);

        let torrent = manager.get_client_for_protocol(Protocol::Torrent).await.unwrap();
        assert_eq!(torrent.unwrap().id, "b");
        let usenet = manager.get_client_for_protocol(Protocol::Usenet).await.unwrap();
        assert_eq!(usenet.unwrap().id, "d");
        assert_eq!(manager.get_enabled_clients().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_no_client_for_protocol() {
        let settings = Arc::new(MemorySettings::default());
        settings.insert(
            DOWNLOAD_CLIENTS_KEY,
            clients_json(&[serde_json::json!({"id":"b","type":"transmission","url":"http://b"})]),
        );
        let manager = manager(&settings);

        assert!(!manager.has_client_for_protocol(Protocol::Usenet).await.unwrap());
        assert!(
            manager
                .get_client_service_for_protocol(Protocol::Usenet)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_invalid_entries_are_skipped() {
        let settings = Arc::new(MemorySettings::default());
        settings.insert(
            DOWNLOAD_CLIENTS_KEY,
            clients_json(&[
                serde_json::json!({"id":"s","type":"sabnzbd","url":"http://s"}),
                serde_json::json!({"id":"q","type":"qbittorrent","url":"http://q"}),
            ]),
        );
        let clients = manager(&settings).get_all_clients().await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].id, "q");
    }

    #[tokio::test]
    async fn test_services_cached_by_config_id() {
        let settings = Arc::new(MemorySettings::default());
        settings.insert(
            DOWNLOAD_CLIENTS_KEY,
            clients_json(&[serde_json::json!({"id":"q","type":"qbittorrent","url":"http://q"})]),
        );
        let manager = manager(&settings);

        let first = manager.get_client_service("q").await.unwrap().unwrap();
        let second = manager.get_client_service("q").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        manager.invalidate().await;
        let third = manager.get_client_service("q").await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert!(manager.get_client_service("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_legacy_migration_runs_once() {
        let settings = Arc::new(MemorySettings::default());
        settings.insert(legacy::TYPE, "qbittorrent");
        settings.insert(legacy::URL, "http://qb:8080");
        settings.insert(legacy::USERNAME, "admin");
        settings.insert(legacy::PASSWORD, "secret");
        settings.insert(legacy::REMOTE_PATH_MAPPING_ENABLED, "true");
        settings.insert(legacy::REMOTE_PATH, "/data");
        settings.insert(legacy::LOCAL_PATH, "/mnt/data");
        let manager = manager(&settings);

        let clients = manager.get_all_clients().await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].kind, ClientKind::Qbittorrent);
        assert_eq!(clients[0].connection.url, "http://qb:8080");
        assert!(clients[0].path_mapping.is_some());

        let writes = settings.write_count(DOWNLOAD_CLIENTS_KEY);
        assert_eq!(writes, 1);

        // Cached: no second migration attempt.
        manager.get_all_clients().await.unwrap();
        assert_eq!(settings.write_count(DOWNLOAD_CLIENTS_KEY), 1);

        // After invalidation the list is non-empty, so nothing is rewritten.
        manager.invalidate().await;
        manager.get_all_clients().await.unwrap();
        assert_eq!(settings.write_count(DOWNLOAD_CLIENTS_KEY), 1);
    }

    #[tokio::test]
    async fn test_legacy_migration_failure_keeps_keys() {
        let settings = Arc::new(MemorySettings::default());
        settings.insert(legacy::TYPE, "utorrent");
        settings.insert(legacy::URL, "http://ut");
        let manager = manager(&settings);

        assert!(manager.get_all_clients().await.unwrap().is_empty());
        assert_eq!(settings.get(legacy::TYPE).as_deref(), Some("utorrent"));
        assert_eq!(settings.write_count(DOWNLOAD_CLIENTS_KEY), 0);
    }

    #[tokio::test]
    async fn test_download_path_for_custom_path() {
        let settings = Arc::new(MemorySettings::default());
        settings.insert(DOWNLOAD_DIR_KEY, "/media/downloads");
        settings.insert(
            DOWNLOAD_CLIENTS_KEY,
            clients_json(&[
                serde_json::json!({"id":"a","type":"qbittorrent","url":"http://a","customPath":"books"}),
                serde_json::json!({"id":"b","type":"deluge","url":"http://b","customPath":"/srv/books"}),
                serde_json::json!({"id":"c","type":"transmission","url":"http://c"}),
            ]),
        );
        let manager = manager(&settings);
        let clients = manager.get_all_clients().await.unwrap();

        assert_eq!(
            manager.download_path_for(&clients[0]).await.unwrap(),
            "/media/downloads/books"
        );
        assert_eq!(manager.download_path_for(&clients[1]).await.unwrap(), "/srv/books");
        assert_eq!(
            manager.download_path_for(&clients[2]).await.unwrap(),
            "/media/downloads"
        );
    }

    #[tokio::test]
    async fn test_connection_uses_fresh_instance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"version":"1.1","result":"24.3"})),
            )
            .mount(&server)
            .await;

        let settings = Arc::new(MemorySettings::default());
        let manager = manager(&settings);
        let config = StoredClientConfig {
            id: "n".into(),
            client_type: "nzbget".into(),
            name: String::new(),
            enabled: true,
            url: server.uri(),
            username: Some("nzbget".into()),
            password: Some("tegbzn6789".into()),
            disable_ssl_verify: false,
            remote_path_mapping_enabled: false,
            remote_path: None,
            local_path: None,
            category: None,
            custom_path: None,
        }
        .validate()
        .unwrap();

        let result = manager.test_connection(&config).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.version.as_deref(), Some("24.3"));
        assert!(manager.services.is_empty());
    }
}
