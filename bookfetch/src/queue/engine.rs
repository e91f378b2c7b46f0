//! Transient queue engine.
//!
//! The engine owns dispatch: priority ordering, worker concurrency, retries
//! with exponential backoff, cron repeatables and the lifecycle events the
//! job queue reconciles into durable rows. [`InMemoryQueueEngine`] keeps its
//! state in process memory; anything not yet persisted by the job queue is
//! lost on restart, which the scheduler's overdue sweep compensates for.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::scheduler::cron_expr;
use crate::{Error, Result};

/// Broadcast channel capacity for engine events.
const EVENT_CAPACITY: usize = 1024;

/// Options for one submitted job.
#[derive(Debug, Clone)]
pub struct EngineJobOptions {
    /// Higher values dispatch first.
    pub priority: i32,
    /// Total attempts before the job is failed for good.
    pub attempts: u32,
    /// Delay before the job becomes eligible for dispatch.
    pub delay: Duration,
}

impl Default for EngineJobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            attempts: 3,
            delay: Duration::ZERO,
        }
    }
}

/// Engine-side view of a job at the moment an event was emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineJobSnapshot {
    /// Engine handle.
    pub id: String,
    /// Job type name.
    pub name: String,
    pub data: Value,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Repeatable registration that fired this job.
    pub repeat_id: Option<String>,
}

/// Lifecycle events, in order per job: `Active` precedes `Completed`,
/// `Failed` or `Stalled`.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Active {
        job: EngineJobSnapshot,
    },
    Completed {
        job: EngineJobSnapshot,
        result: Value,
    },
    /// `job.attempts_made` includes the failed attempt; the engine retries
    /// while it is below `job.max_attempts`.
    Failed {
        job: EngineJobSnapshot,
        error: String,
        stack_trace: Option<String>,
    },
    /// The worker crashed mid-run.
    Stalled {
        job: EngineJobSnapshot,
    },
}

impl EngineEvent {
    pub fn job(&self) -> &EngineJobSnapshot {
        match self {
            Self::Active { job }
            | Self::Completed { job, .. }
            | Self::Failed { job, .. }
            | Self::Stalled { job } => job,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Active { .. } => "active",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Stalled { .. } => "stalled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
    pub repeatables: usize,
    pub paused: bool,
}

/// Executes one job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &EngineJobSnapshot) -> Result<Value>;
}

/// The engine contract the job queue and scheduler depend on.
#[async_trait]
pub trait QueueEngine: Send + Sync {
    /// Submit a job; returns the engine handle.
    async fn add(&self, name: &str, data: Value, options: EngineJobOptions) -> Result<String>;

    /// Register (or replace) a cron repeatable under `repeat_id`.
    async fn add_repeatable(
        &self,
        repeat_id: &str,
        name: &str,
        data: Value,
        cron: &str,
        options: EngineJobOptions,
    ) -> Result<()>;

    /// Returns whether a registration existed.
    async fn remove_repeatable(&self, repeat_id: &str) -> Result<bool>;

    /// Re-run a failed or stalled job. Returns `false` when the engine no
    /// longer knows the handle; errors when the job is not in a failed state.
    async fn retry(&self, engine_job_id: &str) -> Result<bool>;

    /// Remove a waiting or delayed job; an active job finishes but its
    /// outcome is discarded.
    async fn remove(&self, engine_job_id: &str) -> Result<()>;

    async fn pause(&self);
    async fn resume(&self);
    async fn counts(&self) -> EngineCounts;
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub job_timeout: Duration,
    /// First retry delay; doubles per failed attempt.
    pub backoff_base: Duration,
    pub poll_interval: Duration,
    /// Failed jobs kept for `retry`; the oldest are evicted beyond this.
    pub failed_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            job_timeout: Duration::from_secs(30 * 60),
            backoff_base: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            failed_retention: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Waiting,
    Delayed,
    Active,
    Failed,
    /// Removed while active; the outcome is dropped.
    Removed,
}

struct JobEntry {
    snapshot: EngineJobSnapshot,
    priority: i32,
    state: EntryState,
}

#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: i32,
    seq: u64,
    id: String,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct EngineState {
    jobs: HashMap<String, JobEntry>,
    waiting: BinaryHeap<Queued>,
    repeatables: HashMap<String, CancellationToken>,
    paused: bool,
    next_id: u64,
    seq: u64,
    completed: usize,
    /// Failed job ids, oldest first.
    failed_order: VecDeque<String>,
}

impl EngineState {
    fn push_waiting(&mut self, id: &str) {
        let Some(entry) = self.jobs.get_mut(id) else {
            return;
        };
        entry.state = EntryState::Waiting;
        self.seq += 1;
        self.waiting.push(Queued {
            priority: entry.priority,
            seq: self.seq,
            id: id.to_string(),
        });
    }

    fn mark_failed(&mut self, id: &str, retention: usize) {
        let Some(entry) = self.jobs.get_mut(id) else {
            return;
        };
        entry.state = EntryState::Failed;
        self.failed_order.retain(|queued| queued != id);
        self.failed_order.push_back(id.to_string());

        while self.failed_order.len() > retention {
            let Some(oldest) = self.failed_order.pop_front() else {
                break;
            };
            if self
                .jobs
                .get(&oldest)
                .is_some_and(|e| e.state == EntryState::Failed)
            {
                self.jobs.remove(&oldest);
                debug!(engine_job_id = %oldest, "Evicted failed job");
            }
        }
    }

    fn pop_next(&mut self) -> Option<EngineJobSnapshot> {
        if self.paused {
            return None;
        }
        while let Some(queued) = self.waiting.pop() {
            // Stale heap entries (removed or re-queued jobs) are skipped.
            if let Some(entry) = self.jobs.get_mut(&queued.id)
                && entry.state == EntryState::Waiting
            {
                entry.state = EntryState::Active;
                return Some(entry.snapshot.clone());
            }
        }
        None
    }
}

struct Inner {
    config: EngineConfig,
    state: Mutex<EngineState>,
    notify: Notify,
    events: broadcast::Sender<EngineEvent>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Inner {
    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn enqueue(
        self: &Arc<Self>,
        id: Option<String>,
        name: &str,
        data: Value,
        options: &EngineJobOptions,
        repeat_id: Option<String>,
    ) -> String {
        let mut state = self.state.lock();
        let id = id.unwrap_or_else(|| {
            state.next_id += 1;
            state.next_id.to_string()
        });

        state.jobs.insert(
            id.clone(),
            JobEntry {
                snapshot: EngineJobSnapshot {
                    id: id.clone(),
                    name: name.to_string(),
                    data,
                    attempts_made: 0,
                    max_attempts: options.attempts.max(1),
                    repeat_id,
                },
                priority: options.priority,
                state: EntryState::Delayed,
            },
        );

        if options.delay.is_zero() {
            state.push_waiting(&id);
            drop(state);
            self.notify.notify_one();
        } else {
            drop(state);
            self.promote_after(id.clone(), options.delay);
        }
        id
    }

    /// Move a delayed job to waiting once `delay` elapsed.
    fn promote_after(self: &Arc<Self>, id: String, delay: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let mut state = inner.state.lock();
            if state
                .jobs
                .get(&id)
                .is_some_and(|e| e.state == EntryState::Delayed)
            {
                state.push_waiting(&id);
                drop(state);
                inner.notify.notify_one();
            }
        });
    }

    fn on_completed(&self, job: EngineJobSnapshot, result: Value) {
        let mut state = self.state.lock();
        let removed = state
            .jobs
            .remove(&job.id)
            .is_some_and(|e| e.state == EntryState::Removed);
        if removed {
            debug!(engine_job_id = %job.id, "Discarding outcome of removed job");
            return;
        }
        state.completed += 1;
        drop(state);

        let mut job = job;
        job.attempts_made += 1;
        self.emit(EngineEvent::Completed { job, result });
    }

    fn on_failed(self: &Arc<Self>, job: EngineJobSnapshot, error: String, stack: Option<String>) {
        let mut state = self.state.lock();
        let Some(entry) = state.jobs.get_mut(&job.id) else {
            return;
        };
        if entry.state == EntryState::Removed {
            state.jobs.remove(&job.id);
            return;
        }

        entry.snapshot.attempts_made += 1;
        let snapshot = entry.snapshot.clone();
        let retry = snapshot.attempts_made < snapshot.max_attempts;
        if retry {
            entry.state = EntryState::Delayed;
        } else {
            state.mark_failed(&snapshot.id, self.config.failed_retention);
        }
        drop(state);

        if retry {
            let exponent = snapshot.attempts_made.saturating_sub(1).min(16);
            let delay = self.config.backoff_base.saturating_mul(1u32 << exponent);
            debug!(
                engine_job_id = %snapshot.id,
                attempt = snapshot.attempts_made,
                delay_ms = delay.as_millis() as u64,
                "Scheduling retry"
            );
            self.promote_after(snapshot.id.clone(), delay);
        }

        self.emit(EngineEvent::Failed {
            job: snapshot,
            error,
            stack_trace: stack,
        });
    }

    fn on_stalled(&self, job: EngineJobSnapshot) {
        let mut state = self.state.lock();
        match state.jobs.get(&job.id).map(|e| e.state) {
            Some(EntryState::Removed) => {
                state.jobs.remove(&job.id);
            }
            Some(_) => {
                state.mark_failed(&job.id, self.config.failed_retention);
                drop(state);
                self.emit(EngineEvent::Stalled { job });
            }
            None => {}
        }
    }
}

/// In-process engine backed by a priority heap and a semaphore-bounded
/// worker set.
pub struct InMemoryQueueEngine {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryQueueEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
                config,
                state: Mutex::new(EngineState::default()),
                notify: Notify::new(),
                events,
                cancel: CancellationToken::new(),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Start dispatching to `handler`. Calling it twice is a no-op.
    pub fn start(&self, handler: Arc<dyn JobHandler>) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }

        let inner = self.inner.clone();
        info!(
            concurrency = inner.config.concurrency,
            "Starting queue engine dispatcher"
        );

        *dispatcher = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep(inner.config.poll_interval) => {}
                }

                loop {
                    let permit = match inner.semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let Some(job) = inner.state.lock().pop_next() else {
                        break;
                    };
                    tokio::spawn(run_job(inner.clone(), handler.clone(), job, permit));
                }
            }
            debug!("Queue engine dispatcher stopped");
        }));
    }

    /// Stop dispatching and cancel repeatables. Running jobs finish on their own.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Queue engine dispatcher ended abnormally");
        }
        info!("Queue engine stopped");
    }
}

/// First slot strictly after both `now` and the last fired slot, so a
/// wall clock that lags the timer never fires the same slot twice.
fn next_fire(
    schedule: &cron::Schedule,
    now: DateTime<Utc>,
    last_fired: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let from = match last_fired {
        Some(last) if last > now => last,
        _ => now,
    };
    schedule.after(&from).next()
}

async fn run_job(
    inner: Arc<Inner>,
    handler: Arc<dyn JobHandler>,
    job: EngineJobSnapshot,
    permit: OwnedSemaphorePermit,
) {
    inner.emit(EngineEvent::Active { job: job.clone() });

    let timeout = inner.config.job_timeout;
    let task_job = job.clone();
    // Run on its own task so a panic surfaces as a JoinError instead of
    // taking the worker down.
    let outcome = tokio::spawn(async move {
        tokio::time::timeout(timeout, handler.handle(&task_job)).await
    })
    .await;

    match outcome {
        Ok(Ok(Ok(result))) => inner.on_completed(job, result),
        Ok(Ok(Err(e))) => inner.on_failed(job, e.to_string(), Some(format!("{e:?}"))),
        Ok(Err(_)) => {
            let message = format!("Job timed out after {}s", timeout.as_secs());
            inner.on_failed(job, message, None);
        }
        Err(e) if e.is_panic() => {
            error!(engine_job_id = %job.id, name = %job.name, "Job handler panicked");
            inner.on_stalled(job);
        }
        Err(e) => inner.on_failed(job, format!("Job task aborted: {e}"), None),
    }

    drop(permit);
    inner.notify.notify_one();
}

#[async_trait]
impl QueueEngine for InMemoryQueueEngine {
    async fn add(&self, name: &str, data: Value, options: EngineJobOptions) -> Result<String> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::queue("queue engine is stopped"));
        }
        Ok(self.inner.enqueue(None, name, data, &options, None))
    }

    async fn add_repeatable(
        &self,
        repeat_id: &str,
        name: &str,
        data: Value,
        cron: &str,
        options: EngineJobOptions,
    ) -> Result<()> {
        let schedule = cron_expr::parse(cron)?;
        let token = self.inner.cancel.child_token();

        if let Some(previous) = self
            .inner
            .state
            .lock()
            .repeatables
            .insert(repeat_id.to_string(), token.clone())
        {
            previous.cancel();
        }

        let inner = self.inner.clone();
        let repeat_id = repeat_id.to_string();
        let name = name.to_string();
        tokio::spawn(async move {
            let mut last_fired = None;
            while let Some(next) = next_fire(&schedule, Utc::now(), last_fired) {
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                let id = format!("repeat:{repeat_id}:{}", next.timestamp_millis());
                last_fired = Some(next);
                debug!(%repeat_id, engine_job_id = %id, "Repeatable fired");
                inner.enqueue(
                    Some(id),
                    &name,
                    data.clone(),
                    &options,
                    Some(repeat_id.clone()),
                );
            }
        });
        Ok(())
    }

    async fn remove_repeatable(&self, repeat_id: &str) -> Result<bool> {
        let removed = self.inner.state.lock().repeatables.remove(repeat_id);
        Ok(match removed {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        })
    }

    async fn retry(&self, engine_job_id: &str) -> Result<bool> {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.jobs.get_mut(engine_job_id) else {
            return Ok(false);
        };
        if entry.state != EntryState::Failed {
            return Err(Error::queue(format!("job {engine_job_id} is not failed")));
        }
        entry.snapshot.attempts_made = 0;
        state.failed_order.retain(|id| id != engine_job_id);
        state.push_waiting(engine_job_id);
        drop(state);
        self.inner.notify.notify_one();
        Ok(true)
    }

    async fn remove(&self, engine_job_id: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        match state.jobs.get(engine_job_id).map(|e| e.state) {
            Some(EntryState::Active) => {
                if let Some(entry) = state.jobs.get_mut(engine_job_id) {
                    entry.state = EntryState::Removed;
                }
            }
            Some(_) => {
                state.jobs.remove(engine_job_id);
            }
            None => debug!(%engine_job_id, "Remove requested for unknown job"),
        }
        Ok(())
    }

    async fn pause(&self) {
        self.inner.state.lock().paused = true;
        info!("Queue engine paused");
    }

    async fn resume(&self) {
        self.inner.state.lock().paused = false;
        self.inner.notify.notify_one();
        info!("Queue engine resumed");
    }

    async fn counts(&self) -> EngineCounts {
        let state = self.inner.state.lock();
        let mut counts = EngineCounts {
            completed: state.completed,
            repeatables: state.repeatables.len(),
            paused: state.paused,
            ..Default::default()
        };
        for entry in state.jobs.values() {
            match entry.state {
                EntryState::Waiting => counts.waiting += 1,
                EntryState::Delayed => counts.delayed += 1,
                EntryState::Active | EntryState::Removed => counts.active += 1,
                EntryState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> EngineConfig {
        EngineConfig {
            concurrency: 1,
            job_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            failed_retention: 100,
        }
    }

    /// Handler driven by the job name.
    #[derive(Default)]
    struct ScriptedHandler {
        calls: AtomicU32,
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &EngineJobSnapshot) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().push(job.name.clone());
            match job.name.as_str() {
                "flaky" if call < 2 => Err(Error::Other(format!("attempt {call} failed"))),
                "always_fails" => Err(Error::Other("nope".to_string())),
                "panics" => panic!("worker crashed"),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                }
                _ => Ok(serde_json::json!({"ok": job.name})),
            }
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for engine event")
            .unwrap()
    }

    async fn next_terminal(rx: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
        loop {
            let event = next_event(rx).await;
            if !matches!(event, EngineEvent::Active { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_completed_job_emits_active_then_completed() {
        let engine = InMemoryQueueEngine::new(fast_config());
        let mut rx = engine.subscribe();
        engine.start(Arc::new(ScriptedHandler::default()));

        let id = engine
            .add("hello", serde_json::json!({}), EngineJobOptions::default())
            .await
            .unwrap();

        let active = next_event(&mut rx).await;
        assert_eq!(active.kind(), "active");
        assert_eq!(active.job().id, id);

        match next_event(&mut rx).await {
            EngineEvent::Completed { job, result } => {
                assert_eq!(job.id, id);
                assert_eq!(result, serde_json::json!({"ok": "hello"}));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(engine.counts().await.completed, 1);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_priority_order() {
        let engine = InMemoryQueueEngine::new(fast_config());
        let handler = Arc::new(ScriptedHandler::default());
        let mut rx = engine.subscribe();
        engine.pause().await;
        engine.start(handler.clone());

        for (name, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
            engine
                .add(
                    name,
                    Value::Null,
                    EngineJobOptions {
                        priority,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(engine.counts().await.waiting, 3);
        engine.resume().await;

        for _ in 0..3 {
            next_terminal(&mut rx).await;
        }
        assert_eq!(*handler.order.lock(), vec!["high", "mid", "low"]);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let engine = InMemoryQueueEngine::new(fast_config());
        let mut rx = engine.subscribe();
        engine.start(Arc::new(ScriptedHandler::default()));

        engine
            .add("flaky", Value::Null, EngineJobOptions::default())
            .await
            .unwrap();

        for expected_attempts in [1, 2] {
            match next_terminal(&mut rx).await {
                EngineEvent::Failed { job, error, .. } => {
                    assert_eq!(job.attempts_made, expected_attempts);
                    assert!(error.contains("failed"));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(matches!(
            next_terminal(&mut rx).await,
            EngineEvent::Completed { .. }
        ));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_exhausted_job_can_be_retried() {
        let engine = InMemoryQueueEngine::new(fast_config());
        let mut rx = engine.subscribe();
        engine.start(Arc::new(ScriptedHandler::default()));

        let id = engine
            .add(
                "always_fails",
                Value::Null,
                EngineJobOptions {
                    attempts: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        match next_terminal(&mut rx).await {
            EngineEvent::Failed { job, .. } => assert_eq!(job.attempts_made, job.max_attempts),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(engine.counts().await.failed, 1);

        assert!(engine.retry(&id).await.unwrap());
        assert!(matches!(
            next_terminal(&mut rx).await,
            EngineEvent::Failed { .. }
        ));
        assert!(!engine.retry("missing").await.unwrap());
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_panic_reports_stalled() {
        let engine = InMemoryQueueEngine::new(fast_config());
        let mut rx = engine.subscribe();
        engine.start(Arc::new(ScriptedHandler::default()));

        engine
            .add("panics", Value::Null, EngineJobOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            next_terminal(&mut rx).await,
            EngineEvent::Stalled { .. }
        ));

        // The worker slot is released afterwards.
        engine
            .add("after", Value::Null, EngineJobOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            next_terminal(&mut rx).await,
            EngineEvent::Completed { .. }
        ));
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let engine = InMemoryQueueEngine::new(EngineConfig {
            job_timeout: Duration::from_millis(50),
            ..fast_config()
        });
        let mut rx = engine.subscribe();
        engine.start(Arc::new(ScriptedHandler::default()));

        engine
            .add(
                "slow",
                Value::Null,
                EngineJobOptions {
                    attempts: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        match next_terminal(&mut rx).await {
            EngineEvent::Failed { error, .. } => assert!(error.contains("timed out")),
            other => panic!("unexpected event {other:?}"),
        }
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_removed_waiting_job_never_runs() {
        let engine = InMemoryQueueEngine::new(fast_config());
        let handler = Arc::new(ScriptedHandler::default());
        engine.pause().await;
        engine.start(handler.clone());

        let id = engine
            .add("cancelled", Value::Null, EngineJobOptions::default())
            .await
            .unwrap();
        engine.remove(&id).await.unwrap();
        engine.resume().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.counts().await.waiting, 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_repeatable_registration() {
        let engine = InMemoryQueueEngine::new(fast_config());
        engine
            .add_repeatable(
                "scheduled-1",
                "audible_refresh",
                Value::Null,
                "0 0 * * *",
                EngineJobOptions::default(),
            )
            .await
            .unwrap();
        // Re-adding replaces rather than duplicates.
        engine
            .add_repeatable(
                "scheduled-1",
                "audible_refresh",
                Value::Null,
                "0 1 * * *",
                EngineJobOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(engine.counts().await.repeatables, 1);

        assert!(engine.remove_repeatable("scheduled-1").await.unwrap());
        assert!(!engine.remove_repeatable("scheduled-1").await.unwrap());
        assert!(
            engine
                .add_repeatable("bad", "x", Value::Null, "not cron", EngineJobOptions::default())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_failed_jobs_evicted_beyond_retention() {
        let engine = InMemoryQueueEngine::new(EngineConfig {
            failed_retention: 2,
            ..fast_config()
        });
        let mut rx = engine.subscribe();
        engine.start(Arc::new(ScriptedHandler::default()));

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = engine
                .add(
                    "always_fails",
                    Value::Null,
                    EngineJobOptions {
                        attempts: 1,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            ids.push(id);
        }
        for _ in 0..3 {
            assert!(matches!(
                next_terminal(&mut rx).await,
                EngineEvent::Failed { .. }
            ));
        }

        assert_eq!(engine.counts().await.failed, 2);
        assert!(!engine.retry(&ids[0]).await.unwrap());
        assert!(engine.retry(&ids[2]).await.unwrap());
        engine.stop().await;
    }

    #[test]
    fn test_next_fire_never_repeats_a_slot() {
        use chrono::TimeZone;

        let schedule = cron_expr::parse("*/5 * * * *").unwrap();
        let slot = Utc.with_ymd_and_hms(2026, 1, 1, 10, 5, 0).unwrap();
        let lagging_now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 4, 59).unwrap();

        assert_eq!(next_fire(&schedule, lagging_now, None), Some(slot));
        let next = next_fire(&schedule, lagging_now, Some(slot)).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 10, 10, 0).unwrap());

        let later = Utc.with_ymd_and_hms(2026, 1, 1, 10, 12, 0).unwrap();
        assert_eq!(
            next_fire(&schedule, later, Some(slot)),
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 10, 15, 0).unwrap())
        );
    }
}
