use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::Event;

pub mod error;
pub use error::ProviderError;

/// Filesystem-backed provider: JSONL histories and queues under one root directory.
pub mod fs;
/// In-memory provider for tests and ephemeral runtimes.
pub mod in_memory;

/// Logical queues shared by the runtime's dispatchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Instance-addressed messages: starts, completions, signals, control.
    Orchestrator,
    /// Activity executions.
    Worker,
    /// Timer schedules and cancellations.
    Timer,
}

/// Durable queue message. Completions carry the execution id they were
/// issued under so stale ones can be dropped after continue-as-new.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        execution_id: u64,
    },
    ActivityExecute {
        instance: String,
        execution_id: u64,
        seq: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        seq: u64,
        result: Result<String, String>,
    },
    TimerSchedule {
        instance: String,
        execution_id: u64,
        seq: u64,
        fire_at_ms: u64,
    },
    TimerCancel {
        instance: String,
        execution_id: u64,
        seq: u64,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        seq: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        payload: String,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
    SuspendInstance {
        instance: String,
        reason: String,
    },
    ResumeInstance {
        instance: String,
    },
}

impl WorkItem {
    /// Target instance of the message.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerCancel { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::TerminateInstance { instance, .. }
            | WorkItem::SuspendInstance { instance, .. }
            | WorkItem::ResumeInstance { instance } => instance,
        }
    }
}

/// Storage abstraction for append-only orchestration history, the work
/// queues, and the per-instance status snapshot.
///
/// Only the latest execution of an instance is visible. Starting a new
/// execution replaces the previous history, which keeps continue-as-new
/// loops at constant storage.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the latest execution's history. Unknown instances read as empty.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    /// Append events to `execution_id`. Fails permanently when that execution
    /// is no longer the latest. Completion events already present for the
    /// same `seq`, and a second terminal event, are skipped.
    async fn append(&self, instance: &str, execution_id: u64, new_events: Vec<Event>) -> Result<(), ProviderError>;

    /// Latest execution id, `None` for unknown instances.
    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError>;

    /// Create the instance if needed and open a new execution whose history is
    /// exactly `first_event`. Returns the new execution id.
    async fn create_new_execution(&self, instance: &str, first_event: Event) -> Result<u64, ProviderError>;

    /// Remove an instance, its history and its status.
    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError>;

    /// Enumerate known instances.
    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Clear provider data (test utility).
    async fn reset(&self);

    /// Pretty-printed dump of all instances (test utility).
    async fn dump_all_pretty(&self) -> String;

    /// Enqueue a work item. Enqueuing an item equal to one already waiting is a no-op.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError>;

    /// Take the head of a queue and keep it invisible until `ack` or `abandon`.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    /// Delete a peek-locked item.
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;

    /// Return a peek-locked item to the head of its queue.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError>;

    /// Replace (or clear with `None`) the instance's status snapshot.
    async fn set_custom_status(&self, instance: &str, status: Option<String>) -> Result<(), ProviderError>;

    /// Latest status snapshot, if any.
    async fn get_custom_status(&self, instance: &str) -> Result<Option<String>, ProviderError>;
}

/// Drop completion events whose `seq` already completed in `existing` (or
/// earlier in `new_events`), and any terminal event after the first one.
pub(crate) fn dedupe_completions(existing: &[Event], new_events: Vec<Event>) -> Vec<Event> {
    let mut seen: HashSet<(u64, &'static str)> = HashSet::new();
    let mut terminal = false;
    for ev in existing {
        is_fresh(ev, &mut seen, &mut terminal);
    }
    new_events
        .into_iter()
        .filter(|ev| is_fresh(ev, &mut seen, &mut terminal))
        .collect()
}

fn is_fresh(ev: &Event, seen: &mut HashSet<(u64, &'static str)>, terminal: &mut bool) -> bool {
    match ev {
        Event::ActivityCompleted { seq, .. } => seen.insert((*seq, "ac")),
        Event::TimerFired { seq, .. } => seen.insert((*seq, "tf")),
        e if e.is_terminal() => !std::mem::replace(terminal, true),
        _ => true,
    }
}
