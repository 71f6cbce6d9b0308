use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::providers::{HistoryStore, ProviderError, QueueKind, WorkItem};
use crate::runtime::{OrchestrationStatus, WaitError};
use crate::{Event, now_ms};

/// Errors surfaced by the control-plane client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    Provider(ProviderError),
    /// Start requested for an instance that is Pending, Running or Suspended.
    AlreadyActive { instance: String },
    /// Stored payload could not be decoded into the requested type.
    Codec(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Provider(e) => write!(f, "provider error: {e}"),
            ClientError::AlreadyActive { instance } => write!(f, "instance already active: {instance}"),
            ClientError::Codec(e) => write!(f, "codec error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Provider(e)
    }
}

/// Thin client over a `HistoryStore`: starts instances, raises events and
/// control requests, and reads status. Everything it does goes through the
/// store, so it works with or without a runtime in the same process.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn HistoryStore>,
}

impl Client {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Create a new execution of `orchestration` for `instance` and queue its
    /// start. Fails with `AlreadyActive` unless the instance is absent or
    /// terminal. Returns the new execution id.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<u64, ClientError> {
        let status = self.get_orchestration_status(instance).await?;
        if status.is_active() {
            return Err(ClientError::AlreadyActive {
                instance: instance.to_string(),
            });
        }
        let started = Event::OrchestrationStarted {
            name: orchestration.to_string(),
            input: input.into(),
            timestamp_ms: now_ms(),
        };
        let execution_id = self.store.create_new_execution(instance, started).await?;
        self.store.set_custom_status(instance, None).await?;
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: orchestration.to_string(),
                    execution_id,
                },
            )
            .await?;
        info!(instance, orchestration, execution_id, "orchestration start queued");
        Ok(execution_id)
    }

    pub async fn get_orchestration_status(&self, instance: &str) -> Result<OrchestrationStatus, ClientError> {
        let history = self.store.read(instance).await?;
        Ok(OrchestrationStatus::from(history.as_slice()))
    }

    /// Latest status snapshot, decoded as `T`.
    pub async fn get_custom_status<T: DeserializeOwned>(&self, instance: &str) -> Result<Option<T>, ClientError> {
        match self.get_custom_status_raw(instance).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| ClientError::Codec(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn get_custom_status_raw(&self, instance: &str) -> Result<Option<String>, ClientError> {
        Ok(self.store.get_custom_status(instance).await?)
    }

    /// Queue a named event for `instance`. Events for unknown or terminal
    /// instances are dropped by the runtime.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), ClientError> {
        let name = name.into();
        debug!(instance, name=%name, "raising external event");
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name,
                    payload: payload.into(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::TerminateInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn suspend(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::SuspendInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn resume(&self, instance: &str) -> Result<(), ClientError> {
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ResumeInstance {
                    instance: instance.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Poll until `instance` is terminal or `timeout` elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay_ms: u64 = 5;
        loop {
            let status = self
                .get_orchestration_status(instance)
                .await
                .map_err(|e| WaitError::Other(e.to_string()))?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms * 2).min(100);
        }
    }
}
