//! bookfetch library crate.
//!
//! Durable job queue, cron scheduler and download-client orchestration for a
//! self-hosted audiobook server. The binary wires these together through
//! [`services::ServiceContainer`].

pub mod config;
pub mod database;
pub mod downloader;
pub mod error;
pub mod logging;
pub mod notification;
pub mod processors;
pub mod queue;
pub mod scheduler;
pub mod services;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
