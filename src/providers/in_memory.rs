use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use super::{HistoryStore, ProviderError, QueueKind, WorkItem, dedupe_completions};
use crate::Event;

const CAP: usize = 1024;

struct Execution {
    id: u64,
    history: Vec<Event>,
}

/// Process-local provider. Nothing survives the process; useful for tests
/// and for runtimes that do not need restart recovery.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    // instance -> latest execution only
    instances: Mutex<HashMap<String, Execution>>,
    statuses: Mutex<HashMap<String, String>>,
    queues: Mutex<HashMap<QueueKind, VecDeque<WorkItem>>>,
    // Peek-locked items stay here until ack/abandon
    invisible: Mutex<HashMap<(QueueKind, String), WorkItem>>,
    next_token: AtomicU64,
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let g = self.instances.lock().await;
        Ok(g.get(instance).map(|e| e.history.clone()).unwrap_or_default())
    }

    async fn append(&self, instance: &str, execution_id: u64, new_events: Vec<Event>) -> Result<(), ProviderError> {
        let mut g = self.instances.lock().await;
        let exec = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("append", format!("instance not found: {instance}")))?;
        if exec.id != execution_id {
            return Err(ProviderError::permanent(
                "append",
                format!("stale execution {execution_id} for {instance} (latest {})", exec.id),
            ));
        }
        let fresh = dedupe_completions(&exec.history, new_events);
        if exec.history.len() + fresh.len() > CAP {
            return Err(ProviderError::permanent(
                "append",
                format!("history cap exceeded (cap={CAP}, have={}, append={})", exec.history.len(), fresh.len()),
            ));
        }
        exec.history.extend(fresh);
        Ok(())
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        Ok(self.instances.lock().await.get(instance).map(|e| e.id))
    }

    async fn create_new_execution(&self, instance: &str, first_event: Event) -> Result<u64, ProviderError> {
        let mut g = self.instances.lock().await;
        let id = g.get(instance).map(|e| e.id + 1).unwrap_or(1);
        g.insert(
            instance.to_string(),
            Execution {
                id,
                history: vec![first_event],
            },
        );
        Ok(id)
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        if self.instances.lock().await.remove(instance).is_none() {
            return Err(ProviderError::permanent(
                "remove_instance",
                format!("instance not found: {instance}"),
            ));
        }
        self.statuses.lock().await.remove(instance);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.instances.lock().await.keys().cloned().collect())
    }

    async fn reset(&self) {
        self.instances.lock().await.clear();
        self.statuses.lock().await.clear();
        self.queues.lock().await.clear();
        self.invisible.lock().await.clear();
    }

    async fn dump_all_pretty(&self) -> String {
        let g = self.instances.lock().await;
        let mut out = String::new();
        for (inst, exec) in g.iter() {
            out.push_str(&format!("instance={inst} exec#{}\n", exec.id));
            for e in &exec.history {
                out.push_str(&format!("  {e:#?}\n"));
            }
        }
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let mut g = self.queues.lock().await;
        let q = g.entry(kind).or_default();
        if !q.contains(&item) {
            q.push_back(item);
        }
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let item = self.queues.lock().await.get_mut(&kind)?.pop_front()?;
        let token = format!("{kind:?}:{}", self.next_token.fetch_add(1, Ordering::Relaxed));
        self.invisible
            .lock()
            .await
            .insert((kind, token.clone()), item.clone());
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        self.invisible.lock().await.remove(&(kind, token.to_string()));
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let item = self.invisible.lock().await.remove(&(kind, token.to_string()));
        if let Some(item) = item {
            self.queues.lock().await.entry(kind).or_default().push_front(item);
        }
        Ok(())
    }

    async fn set_custom_status(&self, instance: &str, status: Option<String>) -> Result<(), ProviderError> {
        let mut g = self.statuses.lock().await;
        match status {
            Some(s) => {
                g.insert(instance.to_string(), s);
            }
            None => {
                g.remove(instance);
            }
        }
        Ok(())
    }

    async fn get_custom_status(&self, instance: &str) -> Result<Option<String>, ProviderError> {
        Ok(self.statuses.lock().await.get(instance).cloned())
    }
}
