//! Database row models.

pub mod job;
pub mod request;
pub mod scheduled_job;

pub use job::{JobDbModel, JobStatus, JobType};
pub use request::{DownloadHistoryDbModel, RequestDbModel, RequestStatus};
pub use scheduled_job::ScheduledJobDbModel;
