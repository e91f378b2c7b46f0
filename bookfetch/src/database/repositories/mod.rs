//! Repository traits and their SQLx implementations.

pub mod job;
pub mod request;
pub mod scheduled_job;
pub mod settings;

pub use job::{JobRepository, SqlxJobRepository};
pub use request::{RequestRepository, SqlxRequestRepository};
pub use scheduled_job::{ScheduledJobRepository, SqlxScheduledJobRepository};
pub use settings::{SettingsRepository, SqlxSettingsRepository};
