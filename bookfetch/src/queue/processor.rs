//! Processor trait and the registry the engine dispatches through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::engine::{EngineJobSnapshot, JobHandler};
use super::payload::{JobPayload, job_id_of};
use crate::database::models::JobType;
use crate::{Error, Result};

/// What a processor receives for one execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Durable job id, absent for repeat-fired runs.
    pub job_id: Option<String>,
    pub engine_job_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub payload: JobPayload,
}

/// Executes jobs of one type.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Process the job. The returned value is stored verbatim as the result.
    async fn process(&self, ctx: &JobContext) -> Result<Value>;
}

/// Maps job types to processors.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<JobType, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor, replacing any previous one for the same type.
    pub fn register(&mut self, processor: Arc<dyn JobProcessor>) {
        self.processors.insert(processor.job_type(), processor);
    }

    pub fn with(mut self, processor: Arc<dyn JobProcessor>) -> Self {
        self.register(processor);
        self
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.processors.contains_key(&job_type)
    }
}

#[async_trait]
impl JobHandler for ProcessorRegistry {
    async fn handle(&self, job: &EngineJobSnapshot) -> Result<Value> {
        let processor = JobType::parse(&job.name)
            .and_then(|t| self.processors.get(&t))
            .ok_or_else(|| {
                Error::queue(format!("No processor registered for job type {}", job.name))
            })?;

        let ctx = JobContext {
            job_id: job_id_of(&job.data).map(str::to_string),
            engine_job_id: job.id.clone(),
            attempt: job.attempts_made + 1,
            payload: JobPayload::from_value(&job.data)?,
        };
        debug!(job_type = %job.name, engine_job_id = %job.id, attempt = ctx.attempt, "Processing job");
        processor.process(&ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl JobProcessor for Echo {
        fn job_type(&self) -> JobType {
            JobType::AudibleRefresh
        }

        async fn process(&self, ctx: &JobContext) -> Result<Value> {
            Ok(json!({"attempt": ctx.attempt, "jobId": ctx.job_id}))
        }
    }

    fn snapshot(name: &str, data: Value) -> EngineJobSnapshot {
        EngineJobSnapshot {
            id: "1".into(),
            name: name.into(),
            data,
            attempts_made: 1,
            max_attempts: 3,
            repeat_id: None,
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_type() {
        let registry = ProcessorRegistry::new().with(Arc::new(Echo));
        assert!(registry.contains(JobType::AudibleRefresh));

        let result = registry
            .handle(&snapshot(
                "audible_refresh",
                json!({"type": "audible_refresh", "jobId": "j1"}),
            ))
            .await
            .unwrap();
        assert_eq!(result, json!({"attempt": 2, "jobId": "j1"}));
    }

    #[tokio::test]
    async fn test_unregistered_type_fails() {
        let registry = ProcessorRegistry::new();
        let err = registry
            .handle(&snapshot("organize_files", json!({"type": "organize_files"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No processor registered for job type organize_files"));
    }
}
