//! Job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::JobDbModel;
use crate::{Error, Result};

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    async fn find_job(&self, id: &str) -> Result<Option<JobDbModel>>;
    async fn find_by_engine_id(&self, engine_job_id: &str) -> Result<Option<JobDbModel>>;
    async fn list_jobs_by_status(&self, status: &str) -> Result<Vec<JobDbModel>>;
    async fn list_jobs_for_request(&self, request_id: &str) -> Result<Vec<JobDbModel>>;
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    async fn set_engine_job_id(&self, id: &str, engine_job_id: &str) -> Result<()>;
    async fn update_job(&self, job: &JobDbModel) -> Result<()>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        self.find_job(id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn find_job(&self, id: &str) -> Result<Option<JobDbModel>> {
        let job = sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn find_by_engine_id(&self, engine_job_id: &str) -> Result<Option<JobDbModel>> {
        let job = sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE engine_job_id = ?")
            .bind(engine_job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn list_jobs_by_status(&self, status: &str) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE status = ? ORDER BY created_at DESC",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_jobs_for_request(&self, request_id: &str) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE request_id = ? ORDER BY created_at",
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job (
                id, engine_job_id, job_type, payload, priority, status, attempts,
                max_attempts, result, error_message, stack_trace, request_id,
                started_at, completed_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.engine_job_id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(&job.status)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(&job.result)
        .bind(&job.error_message)
        .bind(&job.stack_trace)
        .bind(&job.request_id)
        .bind(&job.started_at)
        .bind(&job.completed_at)
        .bind(&job.created_at)
        .bind(&job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_engine_job_id(&self, id: &str, engine_job_id: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query("UPDATE job SET engine_job_id = ?, updated_at = ? WHERE id = ?")
            .bind(engine_job_id)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_job(&self, job: &JobDbModel) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE job SET
                engine_job_id = ?,
                status = ?,
                attempts = ?,
                result = ?,
                error_message = ?,
                stack_trace = ?,
                started_at = ?,
                completed_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&job.engine_job_id)
        .bind(&job.status)
        .bind(job.attempts)
        .bind(&job.result)
        .bind(&job.error_message)
        .bind(&job.stack_trace)
        .bind(&job.started_at)
        .bind(&job.completed_at)
        .bind(&now)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{JobStatus, JobType};
    use crate::database::test_pool;

    #[tokio::test]
    async fn test_create_patch_and_update() {
        let repo = SqlxJobRepository::new(test_pool().await);
        let job = JobDbModel::new(JobType::MonitorDownload, r#"{"requestId":"r1"}"#, 3)
            .with_request_id(Some("r1".to_string()));
        repo.create_job(&job).await.unwrap();

        repo.set_engine_job_id(&job.id, "7").await.unwrap();
        let mut stored = repo.find_by_engine_id("7").await.unwrap().unwrap();
        assert_eq!(stored.id, job.id);
        assert_eq!(stored.status, "pending");

        stored.status = JobStatus::Failed.to_string();
        stored.attempts = 3;
        stored.error_message = Some("boom".to_string());
        repo.update_job(&stored).await.unwrap();

        let reloaded = repo.get_job(&job.id).await.unwrap();
        assert_eq!(reloaded.status, "failed");
        assert_eq!(reloaded.attempts, 3);
        assert_eq!(reloaded.error_message.as_deref(), Some("boom"));
        assert_eq!(repo.list_jobs_for_request("r1").await.unwrap().len(), 1);
        assert_eq!(repo.list_jobs_by_status("failed").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_job() {
        let repo = SqlxJobRepository::new(test_pool().await);
        let err = repo.get_job("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(repo.find_job("missing").await.unwrap().is_none());
    }
}
