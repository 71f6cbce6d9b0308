#![allow(dead_code)]
use dtf_watchdog::Event;
use dtf_watchdog::providers::{HistoryStore, ProviderError, QueueKind, WorkItem};
use dtf_watchdog::runtime::registry::ActivityRegistry;
use dtf_watchdog::runtime::{Runtime, RuntimeOptions};
use dtf_watchdog::watchdog::{self, WatchdogOptions};
use dtf_watchdog::OrchestrationRegistry;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Poll the store until `pred` holds for the instance's history.
pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, pred: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(hist) = store.read(instance).await
            && pred(&hist)
        {
            return true;
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until the raw custom status satisfies `pred`.
pub async fn wait_for_custom_status<F>(store: Arc<dyn HistoryStore>, instance: &str, pred: F, timeout_ms: u64) -> bool
where
    F: Fn(&str) -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(Some(s)) = store.get_custom_status(instance).await
            && pred(&s)
        {
            return true;
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Watchdog settings small enough for tests.
pub fn fast_watchdog(delay_ms: u64) -> WatchdogOptions {
    WatchdogOptions {
        delay: Duration::from_millis(delay_ms),
        stage_delay: Duration::from_millis(5),
        stage_iterations: 1_000,
        ..WatchdogOptions::default()
    }
}

pub fn fast_runtime_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep: Duration::from_millis(2),
        orchestration_idle_timeout: Duration::from_millis(200),
        ..RuntimeOptions::default()
    }
}

/// Runtime over `store` with the watchdog orchestration and its activity registered.
pub async fn start_watchdog_runtime(store: Arc<dyn HistoryStore>, opts: &WatchdogOptions) -> Arc<Runtime> {
    let activities = watchdog::register_activities(ActivityRegistry::builder(), opts).build();
    let orchestrations = watchdog::register_orchestration(OrchestrationRegistry::builder(), opts).build();
    Runtime::start_with_options(store, Arc::new(activities), orchestrations, fast_runtime_options()).await
}

/// Store wrapper that records enqueued work, tracks how many `read` calls
/// overlap, and fails every read of the configured instances.
pub struct InstrumentedStore {
    inner: Arc<dyn HistoryStore>,
    failing: HashSet<String>,
    read_delay: Duration,
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
    enqueued: Mutex<Vec<(QueueKind, WorkItem)>>,
}

impl InstrumentedStore {
    pub fn new(inner: Arc<dyn HistoryStore>) -> Self {
        Self {
            inner,
            failing: HashSet::new(),
            read_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            enqueued: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_reads_for(mut self, instance: &str) -> Self {
        self.failing.insert(instance.to_string());
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Most `read` calls observed in flight at once.
    pub fn read_high_water(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    pub fn enqueued(&self) -> Vec<(QueueKind, WorkItem)> {
        self.enqueued.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InstrumentedStore {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        if self.failing.contains(instance) {
            return Err(ProviderError::permanent("read", format!("{instance} is unreadable")));
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        let out = self.inner.read(instance).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }

    async fn append(&self, instance: &str, execution_id: u64, new_events: Vec<Event>) -> Result<(), ProviderError> {
        self.inner.append(instance, execution_id, new_events).await
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        self.inner.latest_execution_id(instance).await
    }

    async fn create_new_execution(&self, instance: &str, first_event: Event) -> Result<u64, ProviderError> {
        self.inner.create_new_execution(instance, first_event).await
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        self.inner.remove_instance(instance).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }

    async fn reset(&self) {
        self.inner.reset().await
    }

    async fn dump_all_pretty(&self) -> String {
        self.inner.dump_all_pretty().await
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        self.enqueued.lock().unwrap().push((kind, item.clone()));
        self.inner.enqueue_work(kind, item).await
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        self.inner.dequeue_peek_lock(kind).await
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        self.inner.ack(kind, token).await
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        self.inner.abandon(kind, token).await
    }

    async fn set_custom_status(&self, instance: &str, status: Option<String>) -> Result<(), ProviderError> {
        self.inner.set_custom_status(instance, status).await
    }

    async fn get_custom_status(&self, instance: &str) -> Result<Option<String>, ProviderError> {
        self.inner.get_custom_status(instance).await
    }
}
