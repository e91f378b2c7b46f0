//! In-memory fakes shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::database::repositories::SettingsRepository;
use crate::notification::{NotificationEvent, Notifier};
use crate::queue::{EngineCounts, EngineEvent, EngineJobOptions, QueueEngine};
use crate::Result;

/// Settings store that counts writes per key.
#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
    writes: Mutex<HashMap<String, usize>>,
}

impl MemorySettings {
    /// Seed a value without counting it as a write.
    pub fn insert(&self, key: &str, value: impl Into<String>) {
        self.values.lock().insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    pub fn write_count(&self, key: &str) -> usize {
        self.writes.lock().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SettingsRepository for MemorySettings {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        *self.writes.lock().entry(key.to_string()).or_default() += 1;
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Add(String),
    AddRepeatable { repeat_id: String, cron: String },
    RemoveRepeatable(String),
    Retry(String),
    Remove(String),
    Pause,
    Resume,
}

/// Engine that records calls and never runs anything.
pub struct RecordingEngine {
    calls: Mutex<Vec<EngineCall>>,
    added: Mutex<Vec<(String, Value, EngineJobOptions)>>,
    repeatables: Mutex<HashMap<String, String>>,
    next_id: AtomicU64,
    forget_jobs: AtomicBool,
    events: broadcast::Sender<EngineEvent>,
}

impl Default for RecordingEngine {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            calls: Mutex::new(Vec::new()),
            added: Mutex::new(Vec::new()),
            repeatables: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            forget_jobs: AtomicBool::new(false),
            events,
        }
    }
}

impl RecordingEngine {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    /// Repeatable-related calls only.
    pub fn repeatable_calls(&self) -> Vec<EngineCall> {
        self.calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    EngineCall::AddRepeatable { .. } | EngineCall::RemoveRepeatable(_)
                )
            })
            .collect()
    }

    pub fn added(&self) -> Vec<(String, Value, EngineJobOptions)> {
        self.added.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
        self.added.lock().clear();
    }

    /// Make `retry` behave like an engine that lost its state.
    pub fn forget_jobs(&self) {
        self.forget_jobs.store(true, Ordering::SeqCst);
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl QueueEngine for RecordingEngine {
    async fn add(&self, name: &str, data: Value, options: EngineJobOptions) -> Result<String> {
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        self.calls.lock().push(EngineCall::Add(name.to_string()));
        self.added.lock().push((name.to_string(), data, options));
        Ok(id)
    }

    async fn add_repeatable(
        &self,
        repeat_id: &str,
        _name: &str,
        _data: Value,
        cron: &str,
        _options: EngineJobOptions,
    ) -> Result<()> {
        self.calls.lock().push(EngineCall::AddRepeatable {
            repeat_id: repeat_id.to_string(),
            cron: cron.to_string(),
        });
        self.repeatables
            .lock()
            .insert(repeat_id.to_string(), cron.to_string());
        Ok(())
    }

    async fn remove_repeatable(&self, repeat_id: &str) -> Result<bool> {
        self.calls
            .lock()
            .push(EngineCall::RemoveRepeatable(repeat_id.to_string()));
        Ok(self.repeatables.lock().remove(repeat_id).is_some())
    }

    async fn retry(&self, engine_job_id: &str) -> Result<bool> {
        if self.forget_jobs.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.calls
            .lock()
            .push(EngineCall::Retry(engine_job_id.to_string()));
        Ok(true)
    }

    async fn remove(&self, engine_job_id: &str) -> Result<()> {
        self.calls
            .lock()
            .push(EngineCall::Remove(engine_job_id.to_string()));
        Ok(())
    }

    async fn pause(&self) {
        self.calls.lock().push(EngineCall::Pause);
    }

    async fn resume(&self) {
        self.calls.lock().push(EngineCall::Resume);
    }

    async fn counts(&self) -> EngineCounts {
        EngineCounts {
            repeatables: self.repeatables.lock().len(),
            ..Default::default()
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: NotificationEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
