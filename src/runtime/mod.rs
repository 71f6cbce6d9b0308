use crate::_typed_codec::{Codec, Json};
use crate::client::{Client, ClientError};
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, ProviderError, QueueKind, WorkItem};
use crate::{Action, Event, OrchestrationContext, now_ms};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod completions;
pub mod dispatch;
pub mod registry;
pub mod replay;
pub mod retry;
pub mod router;
pub mod status;
mod timers;

pub use registry::{ActivityRegistry, OrchestrationRegistry, OrchestrationRegistryBuilder};
pub use retry::RetryPolicy;
pub use router::{InstanceRouter, OrchestratorMsg};
pub use status::OrchestrationStatus;

use replay::ReplayEngine as _;

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => f.write_str("timed out waiting for orchestration"),
            WaitError::Other(e) => f.write_str(e),
        }
    }
}

impl std::error::Error for WaitError {}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Tuning knobs for the runtime's dispatchers and instance loops.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sleep between polls of an empty queue.
    pub dispatcher_idle_sleep: Duration,
    /// An instance with nothing to do and nobody waiting on it is unloaded after this long.
    pub orchestration_idle_timeout: Duration,
    /// Max inbox messages folded into one history append.
    pub completion_batch_limit: usize,
    /// Number of worker loops executing activities.
    pub worker_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep: Duration::from_millis(10),
            orchestration_idle_timeout: Duration::from_millis(1000),
            completion_batch_limit: 128,
            worker_concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

type ResultWaiter = oneshot::Sender<(Vec<Event>, Result<String, String>)>;

/// How an instance loop ended.
enum LoopExit {
    /// Terminal event recorded (or found); remaining inbox messages are dropped.
    Terminal,
    /// Unloaded while waiting; remaining inbox messages are redelivered.
    Idle,
}

/// In-process runtime that executes activities and timers and persists
/// history via a `HistoryStore`.
pub struct Runtime {
    router: Arc<InstanceRouter>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn HistoryStore>,
    active_instances: Mutex<HashSet<String>>,
    result_waiters: Mutex<HashMap<String, Vec<ResultWaiter>>>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: Arc<ActivityRegistry>,
    /// Track the current execution ID for each active instance
    current_execution_ids: Mutex<HashMap<String, u64>>,
    options: RuntimeOptions,
    client: Client,
}

impl Runtime {
    const POLLER_GATE_DELAY_MS: u64 = 5;

    /// Start a new runtime using the in-memory history store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a runtime with explicit options. Every non-terminal instance
    /// already in the store is loaded and its pending work re-dispatched.
    pub async fn start_with_options(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let runtime = Arc::new(Self {
            router: Arc::new(InstanceRouter::default()),
            joins: Mutex::new(Vec::new()),
            instance_joins: Mutex::new(Vec::new()),
            client: Client::new(history_store.clone()),
            history_store,
            active_instances: Mutex::new(HashSet::new()),
            result_waiters: Mutex::new(HashMap::new()),
            orchestration_registry,
            activity_registry,
            current_execution_ids: Mutex::new(HashMap::new()),
            options,
        });

        let mut joins = Vec::new();
        joins.push(runtime.clone().start_orchestration_dispatcher());
        for _ in 0..runtime.options.worker_concurrency.max(1) {
            joins.push(runtime.clone().start_work_dispatcher());
        }
        joins.extend(runtime.clone().start_timer_dispatcher());
        runtime.joins.lock().await.extend(joins);

        runtime.bootstrap().await;
        runtime
    }

    async fn bootstrap(self: &Arc<Self>) {
        let instances = match self.history_store.list_instances().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error=%e, "bootstrap: failed to list instances; nothing recovered");
                return;
            }
        };
        let mut recovered = 0usize;
        for inst in instances {
            match self.history_store.read(&inst).await {
                Ok(h) if !h.is_empty() && !h.last().is_some_and(Event::is_terminal) => {
                    if self.ensure_instance_active(&inst, true).await {
                        recovered += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(instance=%inst, error=%e, "bootstrap: failed to read history"),
            }
        }
        if recovered > 0 {
            info!(recovered, "bootstrap: resumed non-terminal instances");
        }
    }

    /// Control-plane client over this runtime's store.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Start an orchestration and return a handle resolving to its final
    /// history and output once the instance reaches a terminal state.
    /// Continuations do not resolve the handle.
    pub async fn start_orchestration(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<JoinHandle<(Vec<Event>, Result<String, String>)>, String> {
        if self.orchestration_registry.get(orchestration_name).is_none() {
            warn!(instance, orchestration = orchestration_name, "starting unregistered orchestration");
        }
        let (tx, rx) = oneshot::channel();
        self.result_waiters
            .lock()
            .await
            .entry(instance.to_string())
            .or_default()
            .push(tx);
        if let Err(e) = self
            .client
            .start_orchestration(instance, orchestration_name, input)
            .await
        {
            self.result_waiters.lock().await.remove(instance);
            return Err(e.to_string());
        }
        Ok(tokio::spawn(async move {
            rx.await
                .unwrap_or_else(|_| (Vec::new(), Err("runtime dropped the result".to_string())))
        }))
    }

    /// Start a typed orchestration; input/output are serialized internally.
    pub async fn start_orchestration_typed<In, Out>(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: In,
    ) -> Result<JoinHandle<(Vec<Event>, Result<Out, String>)>, String>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let payload = Json::encode(&input).map_err(|e| format!("encode: {e}"))?;
        let inner = self.start_orchestration(instance, orchestration_name, payload).await?;
        Ok(tokio::spawn(async move {
            let (hist, res_s) = inner
                .await
                .unwrap_or_else(|e| (Vec::new(), Err(format!("result task failed: {e}"))));
            let res_t: Result<Out, String> = match res_s {
                Ok(s) => Json::decode::<Out>(&s),
                Err(e) => Err(e),
            };
            (hist, res_t)
        }))
    }

    /// Raise an external event by name into an instance.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.client.raise_event(instance, name, payload).await
    }

    /// Request termination of an instance.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.client.terminate(instance, reason).await
    }

    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        self.client.get_orchestration_status(instance).await
    }

    /// Wait until the orchestration reaches a terminal state or the timeout elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        self.client.wait_for_orchestration(instance, timeout).await
    }

    /// Abort background tasks and resident instance loops. Persisted state is
    /// untouched, so another runtime over the same store resumes from it.
    pub async fn shutdown(self: Arc<Self>) {
        for j in self.joins.lock().await.drain(..) {
            j.abort();
        }
        for j in self.instance_joins.lock().await.drain(..) {
            j.abort();
        }
    }

    async fn gate_delay(&self) {
        tokio::time::sleep(Duration::from_millis(Self::POLLER_GATE_DELAY_MS)).await;
    }

    /// Execution id a message must carry to be current: the resident loop's
    /// execution, else the store's latest. `None` for unknown instances.
    async fn current_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        if let Some(&exec_id) = self.current_execution_ids.lock().await.get(instance) {
            return Ok(Some(exec_id));
        }
        self.history_store.latest_execution_id(instance).await
    }

    /// Spawn the instance loop unless one is already active. Returns true when spawned.
    async fn ensure_instance_active(self: &Arc<Self>, instance: &str, recover: bool) -> bool {
        if !self.active_instances.lock().await.insert(instance.to_string()) {
            return false;
        }
        let rt = self.clone();
        let inst = instance.to_string();
        let handle = tokio::spawn(async move { rt.run_instance(inst, recover).await });
        let mut joins = self.instance_joins.lock().await;
        joins.retain(|j| !j.is_finished());
        joins.push(handle);
        true
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Orchestrator).await else {
                    tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
                    continue;
                };
                match item {
                    WorkItem::StartOrchestration {
                        instance,
                        orchestration,
                        execution_id,
                    } => {
                        debug!(instance=%instance, orchestration=%orchestration, execution_id, "StartOrchestration");
                        self.handle_start(&instance, execution_id, token).await;
                    }
                    WorkItem::ActivityCompleted {
                        instance,
                        execution_id,
                        seq,
                        result,
                    } => {
                        self.deliver_or_rehydrate(OrchestratorMsg::ActivityCompleted {
                            instance,
                            execution_id,
                            seq,
                            result,
                            ack_token: Some(token),
                        })
                        .await;
                    }
                    WorkItem::TimerFired {
                        instance,
                        execution_id,
                        seq,
                        fire_at_ms,
                    } => {
                        self.deliver_or_rehydrate(OrchestratorMsg::TimerFired {
                            instance,
                            execution_id,
                            seq,
                            fire_at_ms,
                            ack_token: Some(token),
                        })
                        .await;
                    }
                    WorkItem::ExternalRaised {
                        instance,
                        name,
                        payload,
                    } => {
                        self.deliver_or_rehydrate(OrchestratorMsg::ExternalRaised {
                            instance,
                            name,
                            payload,
                            ack_token: Some(token),
                        })
                        .await;
                    }
                    WorkItem::TerminateInstance { instance, reason } => {
                        self.deliver_or_rehydrate(OrchestratorMsg::Terminate {
                            instance,
                            reason,
                            ack_token: Some(token),
                        })
                        .await;
                    }
                    WorkItem::SuspendInstance { instance, reason } => {
                        self.deliver_or_rehydrate(OrchestratorMsg::Suspend {
                            instance,
                            reason,
                            ack_token: Some(token),
                        })
                        .await;
                    }
                    WorkItem::ResumeInstance { instance } => {
                        self.deliver_or_rehydrate(OrchestratorMsg::Resume {
                            instance,
                            ack_token: Some(token),
                        })
                        .await;
                    }
                    other => {
                        error!(?other, "unexpected WorkItem in Orchestrator dispatcher; dropping");
                        let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                    }
                }
            }
        })
    }

    async fn handle_start(self: &Arc<Self>, instance: &str, execution_id: u64, token: String) {
        if self.ensure_instance_active(instance, false).await {
            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
            return;
        }
        let running = self.current_execution_ids.lock().await.get(instance).copied();
        if running.is_some_and(|r| r >= execution_id) {
            // The resident loop already runs this execution
            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
        } else {
            // A previous execution's loop is still winding down
            let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
            self.gate_delay().await;
        }
    }

    /// Forward an instance-addressed message to its resident loop, loading the
    /// instance first when it is not resident. Messages for unknown or terminal
    /// instances, and completions from older executions, are acked and dropped.
    async fn deliver_or_rehydrate(self: &Arc<Self>, msg: OrchestratorMsg) {
        let instance = msg.instance().to_string();
        let kind = router::kind_of(&msg);
        let Some(token) = msg.ack_token().map(str::to_string) else {
            return;
        };

        let current = match self.current_execution_id(&instance).await {
            Ok(c) => c,
            Err(e) => {
                warn!(instance=%instance, kind, error=%e, "cannot resolve execution; will retry");
                let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
                self.gate_delay().await;
                return;
            }
        };
        let Some(current) = current else {
            debug!(instance=%instance, kind, "dropping message for unknown instance");
            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
            return;
        };
        if let Some(execution_id) = msg.execution_id()
            && execution_id != current
        {
            warn!(
                instance=%instance,
                kind,
                completion_execution_id = execution_id,
                current_execution_id = current,
                "ignoring completion from another execution"
            );
            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
            return;
        }

        if self.router.try_send(msg).await.is_ok() {
            return;
        }

        // Not resident: load it unless there is nothing left to run
        match self.history_store.read(&instance).await {
            Ok(h) if h.is_empty() || h.last().is_some_and(Event::is_terminal) => {
                debug!(instance=%instance, kind, "dropping message for terminal instance");
                let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
            }
            Ok(_) => {
                self.ensure_instance_active(&instance, false).await;
                let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
                self.gate_delay().await;
            }
            Err(e) => {
                warn!(instance=%instance, kind, error=%e, "failed to read history; will retry");
                let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
                self.gate_delay().await;
            }
        }
    }

    fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Worker).await else {
                    tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
                    continue;
                };
                match item {
                    WorkItem::ActivityExecute {
                        instance,
                        execution_id,
                        seq,
                        name,
                        input,
                    } => {
                        debug!(instance=%instance, execution_id, seq, name=%name, "executing activity");
                        let result = match self.activity_registry.get(&name) {
                            Some(handler) => handler.invoke(input).await,
                            None => Err(format!("unregistered:{name}")),
                        };
                        if let Err(e) = &result {
                            warn!(instance=%instance, seq, name=%name, error=%e, "activity failed");
                        }
                        let completion = WorkItem::ActivityCompleted {
                            instance: instance.clone(),
                            execution_id,
                            seq,
                            result,
                        };
                        match self.enqueue(QueueKind::Orchestrator, completion).await {
                            Ok(()) => {
                                let _ = self.history_store.ack(QueueKind::Worker, &token).await;
                            }
                            Err(e) => {
                                error!(instance=%instance, seq, error=%e, "failed to enqueue activity completion");
                                let _ = self.history_store.abandon(QueueKind::Worker, &token).await;
                            }
                        }
                    }
                    other => {
                        error!(?other, "unexpected WorkItem in Worker dispatcher; dropping");
                        let _ = self.history_store.ack(QueueKind::Worker, &token).await;
                    }
                }
            }
        })
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let idle = self.options.dispatcher_idle_sleep;
        let (svc_jh, svc_tx) = timers::TimerService::start(self.history_store.clone(), idle.as_millis() as u64);

        // Intake: move schedules and cancellations from the durable queue into the service
        let intake = tokio::spawn(async move {
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Timer).await else {
                    tokio::time::sleep(idle).await;
                    continue;
                };
                match item {
                    item @ (WorkItem::TimerSchedule { .. } | WorkItem::TimerCancel { .. }) => {
                        if svc_tx.send(item).is_err() {
                            let _ = self.history_store.abandon(QueueKind::Timer, &token).await;
                            return;
                        }
                        let _ = self.history_store.ack(QueueKind::Timer, &token).await;
                    }
                    other => {
                        error!(?other, "unexpected WorkItem in Timer dispatcher; dropping");
                        let _ = self.history_store.ack(QueueKind::Timer, &token).await;
                    }
                }
            }
        });
        vec![svc_jh, intake]
    }

    async fn notify_waiters(&self, instance: &str, history: &[Event], out: &Result<String, String>) {
        if let Some(waiters) = self.result_waiters.lock().await.remove(instance) {
            for w in waiters {
                let _ = w.send((history.to_vec(), out.clone()));
            }
        }
    }

    /// Unregister the inbox and settle messages still queued in it.
    async fn release_inbox(
        &self,
        instance: &str,
        inbox: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
        drop_remaining: bool,
    ) {
        self.router.unregister(instance).await;
        inbox.close();
        while let Ok(msg) = inbox.try_recv() {
            let Some(token) = msg.ack_token() else { continue };
            if drop_remaining {
                let _ = self.history_store.ack(QueueKind::Orchestrator, token).await;
            } else {
                let _ = self.history_store.abandon(QueueKind::Orchestrator, token).await;
            }
        }
    }

    async fn run_instance(self: Arc<Self>, instance: String, recover: bool) {
        // Ensure removal of active flag even if the task panics or is aborted
        struct ActiveGuard {
            rt: Arc<Runtime>,
            inst: String,
        }
        impl Drop for ActiveGuard {
            fn drop(&mut self) {
                let rt = self.rt.clone();
                let inst = std::mem::take(&mut self.inst);
                // Drop can't be async
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        rt.router.unregister(&inst).await;
                        rt.current_execution_ids.lock().await.remove(&inst);
                        rt.active_instances.lock().await.remove(&inst);
                    });
                }
            }
        }
        let _active_guard = ActiveGuard {
            rt: self.clone(),
            inst: instance.clone(),
        };

        let mut inbox = self.router.register(&instance).await;
        match self.drive_instance(&instance, &mut inbox, recover).await {
            Ok(LoopExit::Terminal) => self.release_inbox(&instance, &mut inbox, true).await,
            Ok(LoopExit::Idle) => {
                debug!(instance=%instance, "dehydrating idle instance");
                self.release_inbox(&instance, &mut inbox, false).await;
            }
            Err(e) => {
                error!(instance=%instance, error=%e, "instance loop stopped on provider error; durable state kept");
                self.release_inbox(&instance, &mut inbox, false).await;
            }
        }
    }

    /// Append the terminal event for `out` and resolve waiters.
    async fn finish(
        &self,
        instance: &str,
        execution_id: u64,
        history: &mut Vec<Event>,
        out: Result<String, String>,
    ) -> Result<LoopExit, ProviderError> {
        let term = match &out {
            Ok(output) => Event::OrchestrationCompleted { output: output.clone() },
            Err(error) => Event::OrchestrationFailed { error: error.clone() },
        };
        let store = &self.history_store;
        let events = vec![term.clone()];
        with_retry_append(&self.options.retry, store, instance, execution_id, &events).await?;
        history.push(term);
        match &out {
            Ok(_) => info!(instance, execution_id, "orchestration completed"),
            Err(e) => warn!(instance, execution_id, error=%e, "orchestration failed"),
        }
        self.notify_waiters(instance, history, &out).await;
        Ok(LoopExit::Terminal)
    }

    /// Turn loop of one resident instance: replay, persist, dispatch, then
    /// wait for the next batch of inbox messages.
    async fn drive_instance(
        self: &Arc<Self>,
        instance: &str,
        inbox: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
        recover: bool,
    ) -> Result<LoopExit, ProviderError> {
        let policy = &self.options.retry;
        let store = &self.history_store;

        let mut history = retry::with_retry(policy, "read", move || store.read(instance)).await?;
        let Some(mut execution_id) =
            retry::with_retry(policy, "latest_execution_id", move || store.latest_execution_id(instance)).await?
        else {
            return Ok(LoopExit::Terminal);
        };
        if history.is_empty() || history.last().is_some_and(Event::is_terminal) {
            return Ok(LoopExit::Terminal);
        }
        self.current_execution_ids
            .lock()
            .await
            .insert(instance.to_string(), execution_id);

        let (name, mut input) = match history.first() {
            Some(Event::OrchestrationStarted { name, input, .. } | Event::OrchestrationContinued { name, input, .. }) => {
                (name.clone(), input.clone())
            }
            _ => {
                let err = "history does not begin with a start event".to_string();
                return self.finish(instance, execution_id, &mut history, Err(err)).await;
            }
        };
        let Some(handler) = self.orchestration_registry.get(&name) else {
            return self
                .finish(instance, execution_id, &mut history, Err(format!("unregistered:{name}")))
                .await;
        };

        if recover {
            let h = &history;
            let dispatched = retry::with_retry(policy, "rehydrate_pending", move || {
                completions::rehydrate_pending(instance, execution_id, h, store)
            })
            .await?;
            if dispatched > 0 {
                info!(instance, execution_id, dispatched, "re-dispatched pending work");
            }
        }

        let mut last_status = retry::with_retry(policy, "get_custom_status", move || store.get_custom_status(instance)).await?;
        let engine = replay::DefaultReplayEngine::new();
        let mut turn_index: u64 = 0;
        let mut frontier = crate::default_frontier(&history);
        let mut needs_turn = true;

        loop {
            if needs_turn && !status::is_suspended(&history) {
                let baseline = history.len();
                let turn = engine.replay(history, turn_index, frontier, handler.clone(), input.clone());
                turn_index = turn_index.saturating_add(1);
                history = turn.history;

                if let Some(err) = turn.nondeterminism {
                    history.truncate(baseline);
                    error!(instance, execution_id, error=%err, "replay diverged from history");
                    return self.finish(instance, execution_id, &mut history, Err(err)).await;
                }

                if let Some(status) = turn.custom_status
                    && last_status.as_ref() != Some(&status)
                {
                    let snapshot = &status;
                    retry::with_retry(policy, "set_custom_status", move || {
                        store.set_custom_status(instance, Some(snapshot.clone()))
                    })
                    .await?;
                    last_status = Some(status);
                }

                let continued = turn.actions.iter().find_map(|a| match a {
                    Action::ContinueAsNew { input } => Some(input.clone()),
                    _ => None,
                });
                if let Some(next_input) = continued {
                    let first = Event::OrchestrationContinued {
                        name: name.clone(),
                        input: next_input.clone(),
                        timestamp_ms: now_ms(),
                    };
                    let first_ref = &first;
                    execution_id = retry::with_retry(policy, "create_new_execution", move || {
                        store.create_new_execution(instance, first_ref.clone())
                    })
                    .await?;
                    self.current_execution_ids
                        .lock()
                        .await
                        .insert(instance.to_string(), execution_id);
                    info!(instance, execution_id, "continued as new");
                    history = vec![first];
                    input = next_input;
                    frontier = 0;
                    continue;
                }

                if history.len() > baseline {
                    with_retry_append(policy, store, instance, execution_id, &history[baseline..]).await?;
                }
                frontier = history.len();

                if let Some(out) = turn.output {
                    self.apply_final_cancellations(instance, execution_id, turn.actions).await?;
                    return self.finish(instance, execution_id, &mut history, out).await;
                }
                self.apply_decisions(instance, execution_id, turn.actions).await?;
            }

            // Receive at least one message, or unload on idle timeout
            let first = loop {
                match tokio::time::timeout(self.options.orchestration_idle_timeout, inbox.recv()).await {
                    Ok(Some(msg)) => break msg,
                    Ok(None) => return Ok(LoopExit::Idle),
                    Err(_timeout) => {
                        if !self.result_waiters.lock().await.contains_key(instance) {
                            return Ok(LoopExit::Idle);
                        }
                    }
                }
            };

            let len_before = history.len();
            let mut tokens: Vec<String> = Vec::new();
            let mut next = Some(first);
            let mut taken = 0usize;
            while let Some(msg) = next.take() {
                taken += 1;
                if let Some(eid) = msg.execution_id()
                    && eid != execution_id
                {
                    debug!(instance, execution_id, stale_execution_id = eid, "dropping stale completion");
                    if let Some(t) = msg.ack_token() {
                        let _ = store.ack(QueueKind::Orchestrator, t).await;
                    }
                } else {
                    let (token, _changed) = completions::append_completion(&mut history, msg);
                    tokens.extend(token);
                }
                if taken < self.options.completion_batch_limit {
                    next = inbox.try_recv().ok();
                }
            }

            if history.len() > len_before
                && let Err(e) = with_retry_append(policy, store, instance, execution_id, &history[len_before..]).await
            {
                for t in &tokens {
                    let _ = store.abandon(QueueKind::Orchestrator, t).await;
                }
                return Err(e);
            }
            // Ack peek-locked items now that the history is persisted
            for t in &tokens {
                let _ = store.ack(QueueKind::Orchestrator, t).await;
            }
            needs_turn = history.len() > len_before;

            if let Some(Event::OrchestrationTerminated { reason }) = history.last() {
                let reason = reason.clone();
                info!(instance, execution_id, reason=%reason, "orchestration terminated");
                self.notify_waiters(instance, &history, &Err(format!("terminated: {reason}")))
                    .await;
                return Ok(LoopExit::Terminal);
            }
        }
    }
}

async fn with_retry_append(
    policy: &RetryPolicy,
    store: &Arc<dyn HistoryStore>,
    instance: &str,
    execution_id: u64,
    events: &[Event],
) -> Result<(), ProviderError> {
    retry::with_retry(policy, "append", move || store.append(instance, execution_id, events.to_vec())).await
}
