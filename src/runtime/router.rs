use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

/// Messages delivered to a running instance loop by the orchestrator dispatcher.
/// `ack_token` is the peek-lock token of the queue item the message came from.
#[derive(Debug)]
pub enum OrchestratorMsg {
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        seq: u64,
        result: Result<String, String>,
        ack_token: Option<String>,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        seq: u64,
        fire_at_ms: u64,
        ack_token: Option<String>,
    },
    ExternalRaised {
        instance: String,
        name: String,
        payload: String,
        ack_token: Option<String>,
    },
    Terminate {
        instance: String,
        reason: String,
        ack_token: Option<String>,
    },
    Suspend {
        instance: String,
        reason: String,
        ack_token: Option<String>,
    },
    Resume {
        instance: String,
        ack_token: Option<String>,
    },
}

impl OrchestratorMsg {
    pub fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::ActivityCompleted { instance, .. }
            | OrchestratorMsg::TimerFired { instance, .. }
            | OrchestratorMsg::ExternalRaised { instance, .. }
            | OrchestratorMsg::Terminate { instance, .. }
            | OrchestratorMsg::Suspend { instance, .. }
            | OrchestratorMsg::Resume { instance, .. } => instance,
        }
    }

    /// Execution the message belongs to; `None` for instance-scoped signals.
    pub fn execution_id(&self) -> Option<u64> {
        match self {
            OrchestratorMsg::ActivityCompleted { execution_id, .. } | OrchestratorMsg::TimerFired { execution_id, .. } => {
                Some(*execution_id)
            }
            _ => None,
        }
    }

    pub fn ack_token(&self) -> Option<&str> {
        match self {
            OrchestratorMsg::ActivityCompleted { ack_token, .. }
            | OrchestratorMsg::TimerFired { ack_token, .. }
            | OrchestratorMsg::ExternalRaised { ack_token, .. }
            | OrchestratorMsg::Terminate { ack_token, .. }
            | OrchestratorMsg::Suspend { ack_token, .. }
            | OrchestratorMsg::Resume { ack_token, .. } => ack_token.as_deref(),
        }
    }
}

/// Per-instance inboxes of the instance loops resident in this runtime.
#[derive(Default)]
pub struct InstanceRouter {
    pub(crate) inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    /// Deliver to the instance inbox. The message is handed back when no live
    /// inbox exists so the caller can release its queue lock.
    pub async fn try_send(&self, msg: OrchestratorMsg) -> Result<(), OrchestratorMsg> {
        let key = msg.instance().to_string();
        let kind = kind_of(&msg);
        let mut map = self.inboxes.lock().await;
        let Some(tx) = map.get(&key) else {
            return Err(msg);
        };
        match tx.send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(msg)) => {
                // Receiver dropped; remove stale sender so dispatchers can rehydrate on redelivery
                map.remove(&key);
                warn!(instance=%key, kind=%kind, "router: receiver dropped, removing inbox");
                Err(msg)
            }
        }
    }
}

pub fn kind_of(msg: &OrchestratorMsg) -> &'static str {
    match msg {
        OrchestratorMsg::ActivityCompleted { .. } => "ActivityCompleted",
        OrchestratorMsg::TimerFired { .. } => "TimerFired",
        OrchestratorMsg::ExternalRaised { .. } => "ExternalRaised",
        OrchestratorMsg::Terminate { .. } => "Terminate",
        OrchestratorMsg::Suspend { .. } => "Suspend",
        OrchestratorMsg::Resume { .. } => "Resume",
    }
}
