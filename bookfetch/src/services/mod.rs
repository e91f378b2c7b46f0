//! Application services and their wiring.

pub mod container;

pub use container::{ServiceContainer, ServiceStats};
