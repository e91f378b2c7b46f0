//! Download processor: hands a chosen release to a download client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use download_clients::{AddDownloadOptions, DownloadClient};
use serde_json::{Value, json};
use tracing::info;

use crate::database::models::{DownloadHistoryDbModel, JobType, RequestStatus};
use crate::database::repositories::RequestRepository;
use crate::downloader::DownloadClientManager;
use crate::queue::{JobContext, JobPayload, JobProcessor, JobQueue, MonitorTarget};
use crate::{Error, Result};

/// Processor for `download_torrent` jobs.
///
/// Resolves the client for the release's protocol, submits it, records a
/// download-history row and starts monitoring.
pub struct DownloadTorrentProcessor {
    clients: Arc<DownloadClientManager>,
    requests: Arc<dyn RequestRepository>,
    queue: Arc<JobQueue>,
}

impl DownloadTorrentProcessor {
    pub fn new(
        clients: Arc<DownloadClientManager>,
        requests: Arc<dyn RequestRepository>,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            clients,
            requests,
            queue,
        }
    }
}

#[async_trait]
impl JobProcessor for DownloadTorrentProcessor {
    fn job_type(&self) -> JobType {
        JobType::DownloadTorrent
    }

    async fn process(&self, ctx: &JobContext) -> Result<Value> {
        let JobPayload::DownloadTorrent {
            request_id,
            audiobook_id,
            torrent,
        } = &ctx.payload
        else {
            return Err(Error::queue("download_torrent job carries a different payload"));
        };

        let (config, service) = self
            .clients
            .get_client_service_for_protocol(torrent.protocol)
            .await?
            .ok_or_else(|| {
                Error::config(format!(
                    "No enabled {} download client is configured",
                    torrent.protocol
                ))
            })?;

        let options = AddDownloadOptions::default().with_category(config.category.clone());
        let client_item_id = service.add_download(&torrent.download_url, options).await?;

        let mut history =
            DownloadHistoryDbModel::new(request_id.as_str(), torrent.title.as_str(), config.kind.as_str());
        history.indexer_name = torrent.indexer.clone();
        history.download_client_id = Some(client_item_id.clone());
        history.download_status = "downloading".to_string();
        self.requests.create_download_history(&history).await?;
        self.requests
            .update_request_status(request_id, RequestStatus::Downloading, None)
            .await?;

        let monitor_job_id = self
            .queue
            .add_monitor_job(
                MonitorTarget {
                    request_id: request_id.clone(),
                    audiobook_id: audiobook_id.clone(),
                    download_history_id: history.id.clone(),
                    download_client_id: config.id.clone(),
                    client_item_id: client_item_id.clone(),
                },
                Duration::ZERO,
            )
            .await?;

        info!(
            %request_id,
            client = %config.name,
            %client_item_id,
            title = %torrent.title,
            "Download submitted"
        );

        Ok(json!({
            "downloadHistoryId": history.id,
            "downloadClient": config.kind.as_str(),
            "clientItemId": client_item_id,
            "monitorJobId": monitor_job_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DOWNLOAD_CLIENTS_KEY;
    use crate::database::models::RequestDbModel;
    use crate::database::repositories::{SqlxJobRepository, SqlxRequestRepository};
    use crate::database::test_pool;
    use crate::queue::{JobQueueConfig, SearchResultRef};
    use crate::testing::{MemorySettings, RecordingEngine, RecordingNotifier};
    use download_clients::Protocol;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HASH: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    fn ctx(protocol: Protocol) -> JobContext {
        JobContext {
            job_id: Some("j1".into()),
            engine_job_id: "1".into(),
            attempt: 1,
            payload: JobPayload::DownloadTorrent {
                request_id: "r1".into(),
                audiobook_id: "b1".into(),
                torrent: SearchResultRef {
                    title: "Project Hail Mary".into(),
                    download_url: format!("magnet:?xt=urn:btih:{HASH}"),
                    protocol,
                    size: 1024,
                    indexer: Some("MyAnonamouse".into()),
                    info_hash: None,
                },
            },
        }
    }

    async fn setup(
        server_uri: &str,
    ) -> (
        DownloadTorrentProcessor,
        Arc<SqlxRequestRepository>,
        Arc<RecordingEngine>,
    ) {
        let pool = test_pool().await;
        let requests = Arc::new(SqlxRequestRepository::new(pool.clone()));
        requests
            .create_request(&RequestDbModel::new("r1"))
            .await
            .unwrap();

        let settings = Arc::new(MemorySettings::default());
        settings.insert(
            DOWNLOAD_CLIENTS_KEY,
            json!([{"id": "tr", "type": "transmission", "url": server_uri, "category": "audiobooks"}])
                .to_string(),
        );

        let engine = Arc::new(RecordingEngine::default());
        let queue = Arc::new(JobQueue::new(
            Arc::new(SqlxJobRepository::new(pool)),
            requests.clone(),
            engine.clone(),
            Arc::new(RecordingNotifier::default()),
            JobQueueConfig::default(),
        ));
        let processor = DownloadTorrentProcessor::new(
            Arc::new(DownloadClientManager::new(settings)),
            requests.clone(),
            queue,
        );
        (processor, requests, engine)
    }

    #[tokio::test]
    async fn test_submits_and_starts_monitoring() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transmission/rpc"))
            .and(body_partial_json(json!({ "method": "torrent-get" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": "success",
                "arguments": { "torrents": [] }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/transmission/rpc"))
            .and(body_partial_json(json!({
                "method": "torrent-add",
                "arguments": { "labels": ["audiobooks"] }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": "success",
                "arguments": { "torrent-added": { "hashString": HASH, "id": 1, "name": "Book" } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (processor, requests, engine) = setup(&server.uri()).await;
        let result = processor.process(&ctx(Protocol::Torrent)).await.unwrap();

        assert_eq!(result["clientItemId"], json!(HASH));
        assert_eq!(result["downloadClient"], json!("transmission"));

        let history_id = result["downloadHistoryId"].as_str().unwrap();
        let history = requests
            .get_download_history(history_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.download_status, "downloading");
        assert_eq!(history.download_client_id.as_deref(), Some(HASH));
        assert_eq!(history.indexer_name.as_deref(), Some("MyAnonamouse"));

        let request = requests.get_request("r1").await.unwrap().unwrap();
        assert_eq!(request.status, "downloading");

        let (name, data, options) = engine.added().remove(0);
        assert_eq!(name, "monitor_download");
        assert_eq!(options.delay, Duration::ZERO);
        assert_eq!(data["downloadClientId"], json!("tr"));
        assert_eq!(data["clientItemId"], json!(HASH));
        assert_eq!(data["audiobookId"], json!("b1"));
    }

    #[tokio::test]
    async fn test_missing_client_for_protocol_fails() {
        let server = MockServer::start().await;
        let (processor, requests, engine) = setup(&server.uri()).await;

        let err = processor.process(&ctx(Protocol::Usenet)).await.unwrap_err();
        assert!(err.to_string().contains("No enabled usenet download client"));
        assert!(engine.added().is_empty());
        assert_eq!(
            requests.get_request("r1").await.unwrap().unwrap().status,
            "pending"
        );
    }
}
