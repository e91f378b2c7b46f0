//! Built-in job processors.
//!
//! Search, organize and the scheduled maintenance jobs are provided by the
//! host application and registered next to these.

mod download;
mod monitor;

pub use download::DownloadTorrentProcessor;
pub use monitor::{DEFAULT_MONITOR_INTERVAL, MonitorDownloadProcessor};
