//! Scheduled job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::ScheduledJobDbModel;

#[async_trait]
pub trait ScheduledJobRepository: Send + Sync {
    async fn list_scheduled_jobs(&self) -> Result<Vec<ScheduledJobDbModel>>;
    async fn get_scheduled_job(&self, id: &str) -> Result<Option<ScheduledJobDbModel>>;
    async fn find_by_type(&self, job_type: &str) -> Result<Option<ScheduledJobDbModel>>;
    async fn create_scheduled_job(&self, job: &ScheduledJobDbModel) -> Result<()>;
    async fn update_scheduled_job(&self, job: &ScheduledJobDbModel) -> Result<()>;
    async fn delete_scheduled_job(&self, id: &str) -> Result<()>;
    /// Stamp `last_run`/`last_run_job_id` after a run was enqueued.
    async fn record_run(&self, id: &str, run_at: &str, job_id: &str) -> Result<()>;
}

pub struct SqlxScheduledJobRepository {
    pool: SqlitePool,
}

impl SqlxScheduledJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduledJobRepository for SqlxScheduledJobRepository {
    async fn list_scheduled_jobs(&self) -> Result<Vec<ScheduledJobDbModel>> {
        let jobs = sqlx::query_as::<_, ScheduledJobDbModel>(
            "SELECT * FROM scheduled_job ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn get_scheduled_job(&self, id: &str) -> Result<Option<ScheduledJobDbModel>> {
        let job = sqlx::query_as::<_, ScheduledJobDbModel>("SELECT * FROM scheduled_job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn find_by_type(&self, job_type: &str) -> Result<Option<ScheduledJobDbModel>> {
        let job = sqlx::query_as::<_, ScheduledJobDbModel>(
            "SELECT * FROM scheduled_job WHERE job_type = ? ORDER BY created_at LIMIT 1",
        )
        .bind(job_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn create_scheduled_job(&self, job: &ScheduledJobDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_job (
                id, name, job_type, schedule, enabled, last_run, last_run_job_id,
                payload, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.job_type)
        .bind(&job.schedule)
        .bind(job.enabled)
        .bind(&job.last_run)
        .bind(&job.last_run_job_id)
        .bind(&job.payload)
        .bind(&job.created_at)
        .bind(&job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_scheduled_job(&self, job: &ScheduledJobDbModel) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE scheduled_job SET
                name = ?,
                schedule = ?,
                enabled = ?,
                payload = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&job.name)
        .bind(&job.schedule)
        .bind(job.enabled)
        .bind(&job.payload)
        .bind(&now)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_scheduled_job(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM scheduled_job WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_run(&self, id: &str, run_at: &str, job_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE scheduled_job SET last_run = ?, last_run_job_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(run_at)
        .bind(job_id)
        .bind(run_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
