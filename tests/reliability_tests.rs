use dtf_watchdog::providers::HistoryStore;
use dtf_watchdog::providers::fs::FsHistoryStore;
use dtf_watchdog::providers::in_memory::InMemoryHistoryStore;
use dtf_watchdog::providers::{QueueKind, WorkItem};
use dtf_watchdog::runtime::registry::ActivityRegistry;
use dtf_watchdog::runtime::{self, OrchestrationStatus};
use dtf_watchdog::{Event, OrchestrationContext, OrchestrationRegistry};
use std::sync::Arc as StdArc;
use std::time::Duration;
mod common;

fn activity_then_event() -> OrchestrationRegistry {
    let orch = |ctx: OrchestrationContext, _input: String| async move {
        let a = ctx.schedule_activity("A", "x").into_activity().await?;
        let go = ctx.schedule_wait("Go").into_event().await;
        Ok(format!("{a}:{go}"))
    };
    OrchestrationRegistry::builder().register("ActThenEvt", orch).build()
}

#[tokio::test]
async fn activity_duplicate_completion_workitems_dedup() {
    let store = StdArc::new(InMemoryHistoryStore::default()) as StdArc<dyn HistoryStore>;
    let acts = ActivityRegistry::builder()
        .register("A", |input: String| async move { Ok(format!("{input}!")) })
        .build();
    let rt = runtime::Runtime::start_with_options(
        store.clone(),
        StdArc::new(acts),
        activity_then_event(),
        common::fast_runtime_options(),
    )
    .await;

    let inst = "inst-act-dup";
    let handle = rt.clone().start_orchestration(inst, "ActThenEvt", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            inst,
            |h| h.iter().any(|e| matches!(e, Event::ActivityCompleted { .. })),
            2_000
        )
        .await
    );

    // Redeliver the completion twice, as after a crash between append and ack
    let wi = WorkItem::ActivityCompleted {
        instance: inst.to_string(),
        execution_id: 1,
        seq: 1,
        result: Ok("x!".to_string()),
    };
    store.enqueue_work(QueueKind::Orchestrator, wi.clone()).await.unwrap();
    store.enqueue_work(QueueKind::Orchestrator, wi).await.unwrap();
    rt.raise_event(inst, "Go", "ok").await.unwrap();

    let (hist, out) = handle.await.unwrap();
    assert_eq!(out.unwrap(), "x!:ok");
    let completions = hist
        .iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
        .count();
    assert_eq!(completions, 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn stray_messages_after_terminal_are_dropped() {
    let store = StdArc::new(InMemoryHistoryStore::default()) as StdArc<dyn HistoryStore>;
    let orch = |ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_timer(10).into_timer().await;
        Ok("t".to_string())
    };
    let reg = OrchestrationRegistry::builder().register("OneTimer", orch).build();
    let rt = runtime::Runtime::start_with_options(
        store.clone(),
        StdArc::new(ActivityRegistry::builder().build()),
        reg,
        common::fast_runtime_options(),
    )
    .await;

    let inst = "inst-stray";
    let handle = rt.clone().start_orchestration(inst, "OneTimer", "").await.unwrap();
    let (hist, out) = handle.await.unwrap();
    assert_eq!(out.unwrap(), "t");

    let fire_at_ms = hist
        .iter()
        .find_map(|e| match e {
            Event::TimerCreated { fire_at_ms, .. } => Some(*fire_at_ms),
            _ => None,
        })
        .unwrap();
    store
        .enqueue_work(
            QueueKind::Orchestrator,
            WorkItem::TimerFired {
                instance: inst.to_string(),
                execution_id: 1,
                seq: 1,
                fire_at_ms,
            },
        )
        .await
        .unwrap();
    rt.raise_event(inst, "late", "x").await.unwrap();
    rt.raise_event("no-such-instance", "stop", "").await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.read(inst).await.unwrap(), hist);
    assert!(store.read("no-such-instance").await.unwrap().is_empty());
    rt.shutdown().await;
}

#[tokio::test]
async fn completion_from_previous_execution_is_ignored() {
    let store = StdArc::new(InMemoryHistoryStore::default()) as StdArc<dyn HistoryStore>;
    // Continue once, then wait for an activity in the second execution
    let orch = |ctx: OrchestrationContext, input: String| async move {
        if input == "first" {
            ctx.continue_as_new("second");
            return Ok(String::new());
        }
        let v = ctx.schedule_activity("Slow", "").into_activity().await?;
        Ok(v)
    };
    let reg = OrchestrationRegistry::builder().register("Twice", orch).build();
    let acts = ActivityRegistry::builder()
        .register("Slow", |_input: String| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("real".to_string())
        })
        .build();
    let rt = runtime::Runtime::start_with_options(store.clone(), StdArc::new(acts), reg, common::fast_runtime_options())
        .await;

    let inst = "inst-stale";
    let handle = rt.clone().start_orchestration(inst, "Twice", "first").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            inst,
            |h| h.iter().any(|e| matches!(e, Event::ActivityScheduled { .. })),
            2_000
        )
        .await
    );
    assert_eq!(store.latest_execution_id(inst).await.unwrap(), Some(2));
    store
        .enqueue_work(
            QueueKind::Orchestrator,
            WorkItem::ActivityCompleted {
                instance: inst.to_string(),
                execution_id: 1,
                seq: 1,
                result: Ok("stale".to_string()),
            },
        )
        .await
        .unwrap();

    let (_hist, out) = handle.await.unwrap();
    assert_eq!(out.unwrap(), "real");
    rt.shutdown().await;
}

#[tokio::test]
async fn terminate_ends_a_waiting_instance() {
    let store = StdArc::new(InMemoryHistoryStore::default()) as StdArc<dyn HistoryStore>;
    let orch = |ctx: OrchestrationContext, _input: String| async move { Ok(ctx.schedule_wait("Never").into_event().await) };
    let reg = OrchestrationRegistry::builder().register("Waits", orch).build();
    let rt = runtime::Runtime::start_with_options(
        store.clone(),
        StdArc::new(ActivityRegistry::builder().build()),
        reg,
        common::fast_runtime_options(),
    )
    .await;

    let handle = rt.clone().start_orchestration("inst-term", "Waits", "").await.unwrap();
    rt.terminate_instance("inst-term", "operator").await.unwrap();
    let (_hist, out) = handle.await.unwrap();
    assert_eq!(out, Err("terminated: operator".to_string()));
    assert_eq!(
        rt.get_orchestration_status("inst-term").await.unwrap(),
        OrchestrationStatus::Terminated { reason: "operator".into() }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn suspended_instance_records_events_but_waits_for_resume() {
    let store = StdArc::new(InMemoryHistoryStore::default()) as StdArc<dyn HistoryStore>;
    let orch = |ctx: OrchestrationContext, _input: String| async move { Ok(ctx.schedule_wait("Go").into_event().await) };
    let reg = OrchestrationRegistry::builder().register("WaitGo", orch).build();
    let rt = runtime::Runtime::start_with_options(
        store.clone(),
        StdArc::new(ActivityRegistry::builder().build()),
        reg,
        common::fast_runtime_options(),
    )
    .await;
    let client = rt.client();

    let inst = "inst-suspend";
    let handle = rt.clone().start_orchestration(inst, "WaitGo", "").await.unwrap();
    client.suspend(inst, "maintenance").await.unwrap();
    client.raise_event(inst, "Go", "later").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            inst,
            |h| h.iter().any(|e| matches!(e, Event::ExternalEventReceived { .. })),
            2_000
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        client.get_orchestration_status(inst).await.unwrap(),
        OrchestrationStatus::Suspended
    );

    client.resume(inst).await.unwrap();
    let (_hist, out) = handle.await.unwrap();
    assert_eq!(out.unwrap(), "later");
    rt.shutdown().await;
}

#[tokio::test]
async fn restart_recovers_in_flight_activity_fs() {
    let td = tempfile::tempdir().unwrap();
    let store1 = StdArc::new(FsHistoryStore::new(td.path(), true)) as StdArc<dyn HistoryStore>;
    let stuck = ActivityRegistry::builder()
        .register("A", |_input: String| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("never".to_string())
        })
        .build();
    let rt1 = runtime::Runtime::start_with_options(
        store1.clone(),
        StdArc::new(stuck),
        activity_then_event(),
        common::fast_runtime_options(),
    )
    .await;

    let inst = "inst-restart";
    rt1.client().start_orchestration(inst, "ActThenEvt", "").await.unwrap();
    assert!(
        common::wait_for_history(
            store1.clone(),
            inst,
            |h| h.iter().any(|e| matches!(e, Event::ActivityScheduled { .. })),
            2_000
        )
        .await
    );
    // Let the worker pick the item up before the crash
    tokio::time::sleep(Duration::from_millis(50)).await;
    rt1.shutdown().await;

    let store2 = StdArc::new(FsHistoryStore::new(td.path(), false)) as StdArc<dyn HistoryStore>;
    let acts = ActivityRegistry::builder()
        .register("A", |input: String| async move { Ok(format!("{input}!")) })
        .build();
    let rt2 = runtime::Runtime::start_with_options(
        store2.clone(),
        StdArc::new(acts),
        activity_then_event(),
        common::fast_runtime_options(),
    )
    .await;
    rt2.raise_event(inst, "Go", "back").await.unwrap();

    let status = rt2.wait_for_orchestration(inst, Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "x!:back".into() });
    let hist = store2.read(inst).await.unwrap();
    let completions = hist
        .iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { .. }))
        .count();
    assert_eq!(completions, 1);
    rt2.shutdown().await;
}
