//! Recurring jobs: cron parsing and the scheduler service.

pub mod cron_expr;
pub mod service;

pub use service::{
    CreateScheduledJob, DEFAULT_SCHEDULES, DefaultSchedule, Scheduler, UpdateScheduledJob,
};
