use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use super::router::OrchestratorMsg;
use super::status::is_suspended;
use crate::providers::{HistoryStore, ProviderError, QueueKind, WorkItem};
use crate::{Event, now_ms};

/// Apply one inbox message to the in-memory history.
///
/// Returns the message's ack token and whether history changed. Completions
/// without a matching scheduling event, duplicates, and anything arriving
/// after a terminal event leave history untouched.
pub fn append_completion(history: &mut Vec<Event>, msg: OrchestratorMsg) -> (Option<String>, bool) {
    if history.last().is_some_and(Event::is_terminal) {
        debug!(instance = msg.instance(), kind = super::router::kind_of(&msg), "dropping message for terminal instance");
        return (msg.ack_token().map(str::to_string), false);
    }
    match msg {
        OrchestratorMsg::ActivityCompleted {
            instance,
            seq,
            result,
            ack_token,
            ..
        } => {
            let scheduled = history
                .iter()
                .any(|e| matches!(e, Event::ActivityScheduled { seq: s, .. } if *s == seq));
            if !scheduled {
                warn!(instance=%instance, seq, "dropping activity completion with no matching schedule");
                return (ack_token, false);
            }
            if history
                .iter()
                .any(|e| matches!(e, Event::ActivityCompleted { seq: s, .. } if *s == seq))
            {
                return (ack_token, false);
            }
            history.push(Event::ActivityCompleted {
                seq,
                result,
                timestamp_ms: now_ms(),
            });
            (ack_token, true)
        }
        OrchestratorMsg::TimerFired {
            instance,
            seq,
            fire_at_ms,
            ack_token,
            ..
        } => {
            let created = history
                .iter()
                .any(|e| matches!(e, Event::TimerCreated { seq: s, .. } if *s == seq));
            if !created {
                warn!(instance=%instance, seq, "dropping timer fire with no matching timer");
                return (ack_token, false);
            }
            if history
                .iter()
                .any(|e| matches!(e, Event::TimerFired { seq: s, .. } if *s == seq))
            {
                return (ack_token, false);
            }
            history.push(Event::TimerFired { seq, fire_at_ms });
            (ack_token, true)
        }
        OrchestratorMsg::ExternalRaised {
            name,
            payload,
            ack_token,
            ..
        } => {
            history.push(Event::ExternalEventReceived {
                name,
                payload,
                timestamp_ms: now_ms(),
            });
            (ack_token, true)
        }
        OrchestratorMsg::Terminate { reason, ack_token, .. } => {
            history.push(Event::OrchestrationTerminated { reason });
            (ack_token, true)
        }
        OrchestratorMsg::Suspend { reason, ack_token, .. } => {
            if is_suspended(history) {
                return (ack_token, false);
            }
            history.push(Event::OrchestrationSuspended { reason });
            (ack_token, true)
        }
        OrchestratorMsg::Resume { ack_token, .. } => {
            if !is_suspended(history) {
                return (ack_token, false);
            }
            history.push(Event::OrchestrationResumed);
            (ack_token, true)
        }
    }
}

/// Re-dispatch every activity and timer of `history` that has no completion.
/// Used when an instance is recovered after a restart; duplicates are
/// absorbed by queue dedupe and completion dedupe.
pub async fn rehydrate_pending(
    instance: &str,
    execution_id: u64,
    history: &[Event],
    store: &Arc<dyn HistoryStore>,
) -> Result<usize, ProviderError> {
    let completed_activities: HashSet<u64> = history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityCompleted { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect();
    let fired_timers: HashSet<u64> = history
        .iter()
        .filter_map(|e| match e {
            Event::TimerFired { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect();

    let mut dispatched = 0;
    for e in history {
        match e {
            Event::ActivityScheduled { seq, name, input } if !completed_activities.contains(seq) => {
                store
                    .enqueue_work(
                        QueueKind::Worker,
                        WorkItem::ActivityExecute {
                            instance: instance.to_string(),
                            execution_id,
                            seq: *seq,
                            name: name.clone(),
                            input: input.clone(),
                        },
                    )
                    .await?;
                dispatched += 1;
            }
            Event::TimerCreated { seq, fire_at_ms } if !fired_timers.contains(seq) => {
                store
                    .enqueue_work(
                        QueueKind::Timer,
                        WorkItem::TimerSchedule {
                            instance: instance.to_string(),
                            execution_id,
                            seq: *seq,
                            fire_at_ms: *fire_at_ms,
                        },
                    )
                    .await?;
                dispatched += 1;
            }
            _ => {}
        }
    }
    Ok(dispatched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> Vec<Event> {
        vec![
            Event::OrchestrationStarted {
                name: "Watchdog".into(),
                input: "1".into(),
                timestamp_ms: 0,
            },
            Event::ActivityScheduled {
                seq: 1,
                name: "StartActivity".into(),
                input: "Stage 1".into(),
            },
        ]
    }

    #[test]
    fn completion_requires_schedule_and_is_deduped() {
        let mut h = history();
        let msg = |seq| OrchestratorMsg::ActivityCompleted {
            instance: "i".into(),
            execution_id: 1,
            seq,
            result: Ok("Stage 1".into()),
            ack_token: Some(format!("t{seq}")),
        };
        assert_eq!(append_completion(&mut h, msg(1)), (Some("t1".into()), true));
        assert_eq!(append_completion(&mut h, msg(1)), (Some("t1".into()), false));
        assert_eq!(append_completion(&mut h, msg(7)), (Some("t7".into()), false));
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn nothing_is_appended_after_terminal() {
        let mut h = history();
        let (_, changed) = append_completion(
            &mut h,
            OrchestratorMsg::Terminate {
                instance: "i".into(),
                reason: "ops".into(),
                ack_token: None,
            },
        );
        assert!(changed);
        let (_, changed) = append_completion(
            &mut h,
            OrchestratorMsg::ExternalRaised {
                instance: "i".into(),
                name: "stop".into(),
                payload: String::new(),
                ack_token: None,
            },
        );
        assert!(!changed);
        assert!(h.last().is_some_and(Event::is_terminal));
    }

    #[tokio::test]
    async fn rehydrate_dispatches_only_incomplete_work() {
        let store: Arc<dyn HistoryStore> = Arc::new(crate::providers::in_memory::InMemoryHistoryStore::default());
        let mut h = history();
        h.push(Event::ActivityCompleted {
            seq: 1,
            result: Ok("Stage 1".into()),
            timestamp_ms: 1,
        });
        h.push(Event::TimerCreated { seq: 2, fire_at_ms: 50 });
        let n = rehydrate_pending("i", 1, &h, &store).await.unwrap();
        assert_eq!(n, 1);
        assert!(store.dequeue_peek_lock(QueueKind::Worker).await.is_none());
        let (item, _) = store.dequeue_peek_lock(QueueKind::Timer).await.unwrap();
        assert!(matches!(item, WorkItem::TimerSchedule { seq: 2, fire_at_ms: 50, .. }));
    }
}
