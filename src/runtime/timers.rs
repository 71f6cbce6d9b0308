use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::now_ms;
use crate::providers::{HistoryStore, QueueKind, WorkItem};

type TimerKey = (String, u64, u64);

/// In-process timer service.
/// Keeps a min-ordered queue of scheduled timers and enqueues `TimerFired`
/// on the orchestrator queue once each is due. Cancelled timers are skipped
/// lazily when they reach the head of the heap.
pub struct TimerService {
    store: Arc<dyn HistoryStore>,
    rx: tokio::sync::mpsc::UnboundedReceiver<WorkItem>,
    // (instance, execution_id, seq) -> fire_at_ms
    items: HashMap<TimerKey, u64>,
    min_heap: BinaryHeap<Reverse<(u64, TimerKey)>>,
    poller_idle_ms: u64,
}

impl TimerService {
    pub fn start(
        store: Arc<dyn HistoryStore>,
        poller_idle_ms: u64,
    ) -> (tokio::task::JoinHandle<()>, tokio::sync::mpsc::UnboundedSender<WorkItem>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<WorkItem>();
        let mut svc = TimerService {
            store,
            rx,
            items: HashMap::new(),
            min_heap: BinaryHeap::new(),
            poller_idle_ms,
        };
        let handle = tokio::spawn(async move { svc.run().await });
        (handle, tx)
    }

    async fn run(&mut self) {
        loop {
            while let Ok(item) = self.rx.try_recv() {
                self.apply(item);
            }

            let now = now_ms();
            let mut due: Vec<(TimerKey, u64)> = Vec::new();
            while let Some(Reverse((ts, key))) = self.min_heap.peek().cloned() {
                if ts > now {
                    break;
                }
                let _ = self.min_heap.pop();
                // Absent or rescheduled entries were cancelled
                if self.items.get(&key) == Some(&ts) {
                    self.items.remove(&key);
                    due.push((key, ts));
                }
            }

            for ((instance, execution_id, seq), fire_at_ms) in due.drain(..) {
                debug!(instance=%instance, execution_id, seq, fire_at_ms, "timer due");
                if let Err(e) = self
                    .store
                    .enqueue_work(
                        QueueKind::Orchestrator,
                        WorkItem::TimerFired {
                            instance: instance.clone(),
                            execution_id,
                            seq,
                            fire_at_ms,
                        },
                    )
                    .await
                {
                    // Put it back; the next pass retries
                    warn!(instance=%instance, seq, error=%e, "failed to enqueue TimerFired");
                    let key = (instance, execution_id, seq);
                    self.items.insert(key.clone(), fire_at_ms);
                    self.min_heap.push(Reverse((fire_at_ms, key)));
                    tokio::time::sleep(std::time::Duration::from_millis(self.poller_idle_ms)).await;
                }
            }

            if let Some(Reverse((next_ts, _))) = self.min_heap.peek().cloned() {
                let dur_ms = next_ts.saturating_sub(now_ms()).max(1);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(dur_ms)) => {},
                    maybe = self.rx.recv() => {
                        match maybe {
                            Some(item) => self.apply(item),
                            None => tokio::time::sleep(std::time::Duration::from_millis(self.poller_idle_ms)).await,
                        }
                    }
                }
            } else {
                match self.rx.recv().await {
                    Some(item) => self.apply(item),
                    None => return,
                }
            }
        }
    }

    fn apply(&mut self, item: WorkItem) {
        match item {
            WorkItem::TimerSchedule {
                instance,
                execution_id,
                seq,
                fire_at_ms,
            } => {
                let key = (instance, execution_id, seq);
                if self.items.insert(key.clone(), fire_at_ms) != Some(fire_at_ms) {
                    self.min_heap.push(Reverse((fire_at_ms, key)));
                }
            }
            WorkItem::TimerCancel {
                instance,
                execution_id,
                seq,
            } => {
                if self.items.remove(&(instance.clone(), execution_id, seq)).is_some() {
                    debug!(instance=%instance, execution_id, seq, "timer cancelled");
                }
            }
            other => warn!(?other, "timer service ignoring unexpected work item"),
        }
    }
}
