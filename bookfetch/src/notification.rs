//! Fire-and-forget notifications after terminal job transitions.
//!
//! Delivery channels live outside this crate; the default notifier only logs.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    #[serde(rename_all = "camelCase")]
    RequestFailed {
        request_id: String,
        job_type: String,
        message: String,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent) -> Result<()>;
}

/// Writes every event to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotificationEvent) -> Result<()> {
        match &event {
            NotificationEvent::RequestFailed {
                request_id,
                job_type,
                message,
            } => info!(%request_id, %job_type, %message, "Request failed"),
        }
        Ok(())
    }
}

/// Send without waiting; delivery errors are logged.
pub fn notify_detached(notifier: &Arc<dyn Notifier>, event: NotificationEvent) {
    let notifier = notifier.clone();
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(event).await {
            warn!(error = %e, "Notification delivery failed");
        }
    });
}
