//! Request and download-history repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{DownloadHistoryDbModel, RequestDbModel, RequestStatus};

#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn create_request(&self, request: &RequestDbModel) -> Result<()>;
    async fn get_request(&self, id: &str) -> Result<Option<RequestDbModel>>;
    async fn update_request_status(
        &self,
        id: &str,
        status: RequestStatus,
        error_message: Option<&str>,
    ) -> Result<()>;
    async fn update_request_progress(&self, id: &str, progress: f64) -> Result<()>;

    async fn create_download_history(&self, history: &DownloadHistoryDbModel) -> Result<()>;
    async fn get_download_history(&self, id: &str) -> Result<Option<DownloadHistoryDbModel>>;
    async fn update_download_history(&self, history: &DownloadHistoryDbModel) -> Result<()>;

    /// Mark a request (and optionally its download attempt) failed.
    ///
    /// Repeating the call leaves the rows unchanged.
    async fn fail_download(
        &self,
        request_id: &str,
        download_history_id: Option<&str>,
        message: &str,
    ) -> Result<()>;
}

pub struct SqlxRequestRepository {
    pool: SqlitePool,
}

impl SqlxRequestRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RequestRepository for SqlxRequestRepository {
    async fn create_request(&self, request: &RequestDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO request (id, status, progress, error_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(&request.status)
        .bind(request.progress)
        .bind(&request.error_message)
        .bind(&request.created_at)
        .bind(&request.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_request(&self, id: &str) -> Result<Option<RequestDbModel>> {
        let request = sqlx::query_as::<_, RequestDbModel>("SELECT * FROM request WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(request)
    }

    async fn update_request_status(
        &self,
        id: &str,
        status: RequestStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query("UPDATE request SET status = ?, error_message = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(error_message)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_request_progress(&self, id: &str, progress: f64) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query("UPDATE request SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(progress)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_download_history(&self, history: &DownloadHistoryDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO download_history (
                id, request_id, indexer_name, torrent_name, download_client,
                download_client_id, download_status, download_error, download_path,
                started_at, completed_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&history.id)
        .bind(&history.request_id)
        .bind(&history.indexer_name)
        .bind(&history.torrent_name)
        .bind(&history.download_client)
        .bind(&history.download_client_id)
        .bind(&history.download_status)
        .bind(&history.download_error)
        .bind(&history.download_path)
        .bind(&history.started_at)
        .bind(&history.completed_at)
        .bind(&history.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_download_history(&self, id: &str) -> Result<Option<DownloadHistoryDbModel>> {
        let history = sqlx::query_as::<_, DownloadHistoryDbModel>(
            "SELECT * FROM download_history WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(history)
    }

    async fn update_download_history(&self, history: &DownloadHistoryDbModel) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE download_history SET
                download_client_id = ?,
                download_status = ?,
                download_error = ?,
                download_path = ?,
                completed_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&history.download_client_id)
        .bind(&history.download_status)
        .bind(&history.download_error)
        .bind(&history.download_path)
        .bind(&history.completed_at)
        .bind(&now)
        .bind(&history.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_download(
        &self,
        request_id: &str,
        download_history_id: Option<&str>,
        message: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE request SET status = 'failed', error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(message)
        .bind(&now)
        .bind(request_id)
        .execute(&mut *tx)
        .await?;

        if let Some(history_id) = download_history_id {
            sqlx::query(
                r#"
                UPDATE download_history
                SET download_status = 'failed', download_error = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(message)
            .bind(&now)
            .bind(history_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_pool;

    async fn seeded() -> SqlxRequestRepository {
        let repo = SqlxRequestRepository::new(test_pool().await);
        repo.create_request(&RequestDbModel::new("r1")).await.unwrap();
        repo
    }

    #[tokio::test]
    async fn test_status_and_progress() {
        let repo = seeded().await;
        repo.update_request_status("r1", RequestStatus::Downloading, None)
            .await
            .unwrap();
        repo.update_request_progress("r1", 0.5).await.unwrap();

        let request = repo.get_request("r1").await.unwrap().unwrap();
        assert_eq!(request.status, "downloading");
        assert_eq!(request.progress, 0.5);
    }

    #[tokio::test]
    async fn test_fail_download_is_repeatable() {
        let repo = seeded().await;
        let history = DownloadHistoryDbModel::new("r1", "Some Book", "qbittorrent");
        repo.create_download_history(&history).await.unwrap();

        for _ in 0..2 {
            repo.fail_download("r1", Some(&history.id), "Download failed")
                .await
                .unwrap();
        }

        let request = repo.get_request("r1").await.unwrap().unwrap();
        assert_eq!(request.status, "failed");
        assert_eq!(request.error_message.as_deref(), Some("Download failed"));

        let stored = repo.get_download_history(&history.id).await.unwrap().unwrap();
        assert_eq!(stored.download_status, "failed");
        assert_eq!(stored.download_error.as_deref(), Some("Download failed"));
    }
}
