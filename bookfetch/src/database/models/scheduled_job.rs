//! Scheduled job database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::JobType;

/// A named recurring job definition.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ScheduledJobDbModel {
    pub id: String,
    pub name: String,
    pub job_type: String,
    /// Five-field cron expression.
    pub schedule: String,
    pub enabled: bool,
    pub last_run: Option<String>,
    pub last_run_job_id: Option<String>,
    /// Free-form JSON options kept with the definition.
    pub payload: String,
    pub created_at: String,
    pub updated_at: String,
}

impl ScheduledJobDbModel {
    pub fn new(
        name: impl Into<String>,
        job_type: JobType,
        schedule: impl Into<String>,
        enabled: bool,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            job_type: job_type.as_str().to_string(),
            schedule: schedule.into(),
            enabled,
            last_run: None,
            last_run_job_id: None,
            payload: "{}".to_string(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn last_run_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.last_run
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }
}
