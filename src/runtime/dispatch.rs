use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::Runtime;
use super::retry::with_retry;
use crate::Action;
use crate::providers::{ProviderError, QueueKind, WorkItem};

impl Runtime {
    /// Materialize a turn's decisions as work items. Continue-as-new is
    /// handled by the instance loop before this is called.
    pub(crate) async fn apply_decisions(
        self: &Arc<Self>,
        instance: &str,
        execution_id: u64,
        actions: Vec<Action>,
    ) -> Result<(), ProviderError> {
        for action in drop_cancelled_timers(actions) {
            match action {
                Action::CallActivity { seq, name, input } => {
                    debug!(instance, execution_id, seq, name=%name, "dispatch activity");
                    self.enqueue(
                        QueueKind::Worker,
                        WorkItem::ActivityExecute {
                            instance: instance.to_string(),
                            execution_id,
                            seq,
                            name,
                            input,
                        },
                    )
                    .await?;
                }
                Action::CreateTimer { seq, fire_at_ms } => {
                    debug!(instance, execution_id, seq, fire_at_ms, "dispatch timer");
                    self.enqueue(
                        QueueKind::Timer,
                        WorkItem::TimerSchedule {
                            instance: instance.to_string(),
                            execution_id,
                            seq,
                            fire_at_ms,
                        },
                    )
                    .await?;
                }
                Action::CancelTimer { seq } => {
                    debug!(instance, execution_id, seq, "cancel timer");
                    self.enqueue(
                        QueueKind::Timer,
                        WorkItem::TimerCancel {
                            instance: instance.to_string(),
                            execution_id,
                            seq,
                        },
                    )
                    .await?;
                }
                Action::WaitExternal { name } => {
                    // Delivery is instance-addressed; nothing to dispatch
                    debug!(instance, execution_id, name=%name, "waiting for external event");
                }
                Action::ContinueAsNew { .. } => {}
            }
        }
        Ok(())
    }

    /// Dispatch the timer cancellations of a turn that also completed the
    /// execution. Everything else the final turn issued is moot.
    pub(crate) async fn apply_final_cancellations(
        self: &Arc<Self>,
        instance: &str,
        execution_id: u64,
        actions: Vec<Action>,
    ) -> Result<(), ProviderError> {
        let cancels = drop_cancelled_timers(actions)
            .into_iter()
            .filter(|a| matches!(a, Action::CancelTimer { .. }))
            .collect();
        self.apply_decisions(instance, execution_id, cancels).await
    }

    pub(crate) async fn enqueue(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let store = &self.history_store;
        let item = &item;
        with_retry(&self.options.retry, "enqueue_work", move || store.enqueue_work(kind, item.clone())).await
    }
}

/// A timer created and cancelled within one turn never reaches the timer
/// service: both actions are dropped.
pub(crate) fn drop_cancelled_timers(actions: Vec<Action>) -> Vec<Action> {
    let created: HashSet<u64> = actions
        .iter()
        .filter_map(|a| match a {
            Action::CreateTimer { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect();
    let both: HashSet<u64> = actions
        .iter()
        .filter_map(|a| match a {
            Action::CancelTimer { seq } if created.contains(seq) => Some(*seq),
            _ => None,
        })
        .collect();
    actions
        .into_iter()
        .filter(|a| match a {
            Action::CreateTimer { seq, .. } | Action::CancelTimer { seq } => !both.contains(seq),
            _ => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_turn_create_and_cancel_cancel_out() {
        let actions = vec![
            Action::CallActivity {
                seq: 1,
                name: "A".into(),
                input: "x".into(),
            },
            Action::CreateTimer { seq: 2, fire_at_ms: 10 },
            Action::WaitExternal { name: "stop".into() },
            Action::CancelTimer { seq: 2 },
            Action::CancelTimer { seq: 7 },
        ];
        assert_eq!(
            drop_cancelled_timers(actions),
            vec![
                Action::CallActivity {
                    seq: 1,
                    name: "A".into(),
                    input: "x".into(),
                },
                Action::WaitExternal { name: "stop".into() },
                Action::CancelTimer { seq: 7 },
            ]
        );
    }
}
