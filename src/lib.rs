//! Durable watchdog orchestrations on a deterministic replay core.
//!
//! The crate records append-only `Event`s per orchestration instance and
//! replays them to make orchestration logic deterministic. It provides:
//!
//! - Public data model: `Event`, `Action`
//! - Orchestration driver: `run_turn` and `run_turn_with`
//! - An `OrchestrationContext` with futures to schedule activities,
//!   timers, and external events correlated by issuance sequence number
//! - A unified `DurableFuture` that can be composed with `join`/`select`
//! - The in-process `runtime`, the `client` control plane, the `watchdog`
//!   orchestration and the `fleet` lifecycle controller built on top
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod client;
pub mod fleet;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod watchdog;

pub use client::Client;
pub use futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use runtime::{OrchestrationHandler, OrchestrationRegistry, OrchestrationRegistryBuilder, OrchestrationStatus};

use crate::_typed_codec::Codec;
use crate::futures::{AggregateDurableFuture, Kind};

// Internal codec utilities for typed I/O
mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Plain strings travel unquoted so string inputs stay readable in history
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => serde_json::from_value(Value::String(s.to_string())).map_err(|e| e.to_string()),
            }
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. `seq` is the issuance sequence number pairing a
/// scheduling event with its completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// First event of a fresh instance.
    OrchestrationStarted { name: String, input: String, timestamp_ms: u64 },
    /// First event of an execution produced by continue-as-new. Older history is gone.
    OrchestrationContinued { name: String, input: String, timestamp_ms: u64 },

    /// Activity was scheduled under `seq`.
    ActivityScheduled { seq: u64, name: String, input: String },
    /// Activity finished; `Err` carries the failure message.
    ActivityCompleted {
        seq: u64,
        result: Result<String, String>,
        timestamp_ms: u64,
    },

    /// Durable timer created to fire at `fire_at_ms`.
    TimerCreated { seq: u64, fire_at_ms: u64 },
    /// Durable timer fired.
    TimerFired { seq: u64, fire_at_ms: u64 },

    /// Named external signal delivered to the instance. Buffered until a waiter consumes it.
    ExternalEventReceived { name: String, payload: String, timestamp_ms: u64 },

    OrchestrationSuspended { reason: String },
    OrchestrationResumed,

    OrchestrationCompleted { output: String },
    OrchestrationFailed { error: String },
    OrchestrationTerminated { reason: String },
}

impl Event {
    /// True for events that end an instance for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. } | Event::OrchestrationFailed { .. } | Event::OrchestrationTerminated { .. }
        )
    }

    /// Logical timestamp carried by the event, if any.
    pub fn timestamp_ms(&self) -> Option<u64> {
        match self {
            Event::OrchestrationStarted { timestamp_ms, .. }
            | Event::OrchestrationContinued { timestamp_ms, .. }
            | Event::ActivityCompleted { timestamp_ms, .. }
            | Event::ExternalEventReceived { timestamp_ms, .. } => Some(*timestamp_ms),
            Event::TimerFired { fire_at_ms, .. } => Some(*fire_at_ms),
            _ => None,
        }
    }

    fn scheduled_seq(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { seq, .. } | Event::TimerCreated { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}

/// Declarative decisions produced by an orchestration turn. The runtime
/// materializes these into work items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { seq: u64, name: String, input: String },
    /// Create a timer that fires at an absolute logical time.
    CreateTimer { seq: u64, fire_at_ms: u64 },
    /// Best-effort cancellation of a timer that has not fired.
    CancelTimer { seq: u64 },
    /// The orchestration is suspended waiting for a named external event.
    WaitExternal { name: String },
    /// Restart the orchestration with fresh history and the given input.
    ContinueAsNew { input: String },
}

#[derive(Debug)]
struct CtxInner {
    history: Vec<Event>,
    actions: Vec<Action>,
    next_seq: u64,
    // name -> number of waits issued so far in this turn
    wait_cursors: HashMap<String, usize>,

    turn_index: u64,
    // history index where events not seen by any earlier turn begin
    replay_frontier: usize,
    observed_new: bool,

    logical_time_ms: u64,
    custom_status: Option<String>,
    nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(history: Vec<Event>, turn_index: u64, replay_frontier: usize) -> Self {
        let logical_time_ms = history.first().and_then(Event::timestamp_ms).unwrap_or(0);
        Self {
            history,
            actions: Vec::new(),
            next_seq: 1,
            wait_cursors: HashMap::new(),
            turn_index,
            replay_frontier,
            observed_new: replay_frontier == 0,
            logical_time_ms,
            custom_status: None,
            nondeterminism: None,
        }
    }

    fn record_action(&mut self, a: Action) {
        // A new decision means this poll is past the replayed prefix
        self.observed_new = true;
        self.actions.push(a);
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Mark the history event at `index` as consumed by the orchestration body.
    pub(crate) fn observe(&mut self, index: usize) {
        if index >= self.replay_frontier {
            self.observed_new = true;
        }
        if let Some(ts) = self.history.get(index).and_then(Event::timestamp_ms) {
            self.logical_time_ms = self.logical_time_ms.max(ts);
        }
    }

    fn fail_nondeterministic(&mut self, msg: String) {
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(msg);
        }
    }
}

enum Issue {
    Activity { name: String, input: String },
    Timer { fire_at_ms: u64 },
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context from an existing history vector.
    pub fn new(history: Vec<Event>) -> Self {
        let frontier = default_frontier(&history);
        Self::for_turn(history, 0, frontier)
    }

    fn for_turn(history: Vec<Event>, turn_index: u64, replay_frontier: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history, turn_index, replay_frontier))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The zero-based turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.lock().turn_index
    }

    /// Replay-safe logging gate used by the `durable_*!` macros.
    pub fn is_logging_enabled(&self) -> bool {
        self.lock().observed_new
    }

    /// Deterministic logical time in milliseconds since the epoch: the start
    /// event's timestamp, advanced by every completion consumed so far.
    pub fn utc_now_ms(&self) -> u64 {
        self.lock().logical_time_ms
    }

    /// `utc_now_ms` as a UTC date-time.
    pub fn utc_now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.utc_now_ms() as i64).unwrap_or_default()
    }

    /// Publish an observational status snapshot. The last value set during a
    /// turn is persisted by the runtime; it is never fed back into replay.
    pub fn set_custom_status<T: Serialize>(&self, status: &T) {
        match serde_json::to_string(status) {
            Ok(s) => self.lock().custom_status = Some(s),
            Err(e) => tracing::warn!(error = %e, "custom status is not serializable; ignored"),
        }
    }

    /// Finish this execution and restart the orchestration with `input` and empty history.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        self.lock().record_action(Action::ContinueAsNew { input: input.into() });
    }

    fn issue(&self, op: Issue) -> u64 {
        let mut inner = self.lock();
        let seq = inner.next_seq();
        let recorded = inner.history.iter().find(|e| e.scheduled_seq() == Some(seq)).cloned();
        match (recorded, op) {
            (Some(Event::ActivityScheduled { name: n, input: i, .. }), Issue::Activity { name, input })
                if n == name && i == input => {}
            (Some(Event::TimerCreated { fire_at_ms: f, .. }), Issue::Timer { fire_at_ms }) if f == fire_at_ms => {}
            (Some(recorded), op) => {
                let issued = match op {
                    Issue::Activity { name, input } => format!("activity {name}({input})"),
                    Issue::Timer { fire_at_ms } => format!("timer at {fire_at_ms}"),
                };
                inner.fail_nondeterministic(format!(
                    "nondeterministic: seq {seq} was recorded as {recorded:?} but the orchestration issued {issued}"
                ));
            }
            (None, Issue::Activity { name, input }) => {
                inner.history.push(Event::ActivityScheduled {
                    seq,
                    name: name.clone(),
                    input: input.clone(),
                });
                inner.record_action(Action::CallActivity { seq, name, input });
            }
            (None, Issue::Timer { fire_at_ms }) => {
                inner.history.push(Event::TimerCreated { seq, fire_at_ms });
                inner.record_action(Action::CreateTimer { seq, fire_at_ms });
            }
        }
        seq
    }

    /// Schedule an activity and return a `DurableFuture` correlated to it.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let seq = self.issue(Issue::Activity {
            name: name.into(),
            input: input.into(),
        });
        DurableFuture(Kind::Activity { seq, ctx: self.clone() })
    }

    /// Typed helper that serializes input; pair with `into_activity_typed`.
    pub fn schedule_activity_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<DurableFuture, String> {
        let payload = _typed_codec::Json::encode(input)?;
        Ok(self.schedule_activity(name, payload))
    }

    /// Schedule a timer `delay_ms` after the current logical time.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        let fire_at_ms = self.utc_now_ms().saturating_add(delay_ms);
        self.schedule_timer_at(fire_at_ms)
    }

    /// Schedule a timer for an absolute logical time.
    pub fn schedule_timer_at(&self, fire_at_ms: u64) -> DurableFuture {
        let seq = self.issue(Issue::Timer { fire_at_ms });
        DurableFuture(Kind::Timer { seq, ctx: self.clone() })
    }

    /// Wait for the next external event named `name`. Events delivered
    /// before the wait was issued are matched in arrival order.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let mut inner = self.lock();
        let cursor = inner.wait_cursors.entry(name.clone()).or_insert(0);
        let ordinal = *cursor;
        *cursor += 1;
        let delivered = inner
            .history
            .iter()
            .filter(|e| matches!(e, Event::ExternalEventReceived { name: n, .. } if n == &name))
            .count();
        if delivered <= ordinal {
            // Not a new decision: every turn that reaches this wait reports it
            inner.actions.push(Action::WaitExternal { name: name.clone() });
        }
        drop(inner);
        DurableFuture(Kind::External {
            name,
            ordinal,
            ctx: self.clone(),
        })
    }

    /// Ask the runtime to drop a pending timer. No-op when the future is not
    /// a timer or the timer already fired.
    pub fn cancel_timer(&self, timer: &DurableFuture) {
        if let Kind::Timer { seq, .. } = &timer.0 {
            self.cancel_timer_seq(*seq);
        }
    }

    /// `cancel_timer` by issuance sequence number, for timers already moved
    /// into a `select`.
    pub fn cancel_timer_seq(&self, seq: u64) {
        let mut inner = self.lock();
        if !matches!(inner.history.iter().find(|e| e.scheduled_seq() == Some(seq)), Some(Event::TimerCreated { .. })) {
            return;
        }
        let fired = inner
            .history
            .iter()
            .any(|e| matches!(e, Event::TimerFired { seq: s, .. } if *s == seq));
        if !fired {
            inner.record_action(Action::CancelTimer { seq });
        }
    }
}

impl OrchestrationContext {
    /// Deterministic select over two futures: the completion recorded
    /// earliest in history wins. Returns `(winner_index, output)`.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new_select(self.clone(), vec![a, b]))
    }
    /// Deterministic select over N futures by history order.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new_select(self.clone(), futures))
    }
    /// Select where the lowest index among completed futures wins,
    /// regardless of the order their completions were recorded.
    pub fn select_biased(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture(AggregateDurableFuture::new_select_biased(self.clone(), futures))
    }
    /// Join over N futures; outputs are returned in argument order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture(AggregateDurableFuture::new_join(self.clone(), futures))
    }
}

fn default_frontier(history: &[Event]) -> usize {
    // A history holding only its start event has nothing to replay
    if history.len() <= 1 { 0 } else { history.len() }
}

fn poll_once<F: Future>(fut: std::pin::Pin<&mut F>) -> Poll<F::Output> {
    let mut cx = Context::from_waker(Waker::noop());
    fut.poll(&mut cx)
}

/// Outcome of polling an orchestration once over a history.
#[derive(Debug)]
pub struct TurnResult<O> {
    /// History after the turn, including newly appended scheduling events.
    pub history: Vec<Event>,
    /// Decisions the host must materialize.
    pub actions: Vec<Action>,
    /// Set when the orchestration returned during this turn.
    pub output: Option<O>,
    /// Last status published during the turn.
    pub custom_status: Option<String>,
    /// Set when replay diverged from recorded history.
    pub nondeterminism: Option<String>,
}

/// Poll the orchestrator once with the provided history.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let frontier = default_frontier(&history);
    run_turn_with(history, 0, frontier, orchestrator)
}

/// Same as `run_turn` with an explicit turn index and replay frontier:
/// history events at or past `replay_frontier` are treated as new for
/// replay-safe logging.
pub fn run_turn_with<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    replay_frontier: usize,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::for_turn(history, turn_index, replay_frontier);
    let fut = orchestrator(ctx.clone());
    let fut = std::pin::pin!(fut);
    let output = match poll_once(fut) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };
    let mut inner = ctx.lock();
    TurnResult {
        history: std::mem::take(&mut inner.history),
        actions: std::mem::take(&mut inner.actions),
        output,
        custom_status: inner.custom_status.take(),
        nondeterminism: inner.nondeterminism.take(),
    }
}
