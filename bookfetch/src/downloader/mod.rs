//! Download client selection and lifecycle.

pub mod manager;

pub use manager::DownloadClientManager;
