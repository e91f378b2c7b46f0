//! Job orchestration.
//!
//! - [`engine`]: the transient dispatcher (priorities, workers, retries, cron)
//! - [`job_queue`]: durable job rows and engine event reconciliation
//! - [`payload`]: typed job payloads
//! - [`processor`]: the processor trait and registry

pub mod engine;
pub mod job_queue;
pub mod payload;
pub mod processor;

pub use engine::{
    EngineConfig, EngineCounts, EngineEvent, EngineJobOptions, EngineJobSnapshot,
    InMemoryQueueEngine, JobHandler, QueueEngine,
};
pub use job_queue::{JobQueue, JobQueueConfig, QueueEvent, repeat_id};
pub use payload::{AudiobookRef, JobPayload, MonitorTarget, ScheduledRun, SearchResultRef};
pub use processor::{JobContext, JobProcessor, ProcessorRegistry};
