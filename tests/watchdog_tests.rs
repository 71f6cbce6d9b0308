use dtf_watchdog::providers::fs::FsHistoryStore;
use dtf_watchdog::providers::in_memory::InMemoryHistoryStore;
use dtf_watchdog::providers::{HistoryStore, QueueKind, WorkItem};
use dtf_watchdog::runtime::OrchestrationStatus;
use dtf_watchdog::watchdog::{self, WatchdogStatus};
use dtf_watchdog::Event;
use std::sync::Arc;
use std::time::Duration;

mod common;

#[tokio::test]
async fn stop_during_sleep_completes_with_cancelled_status() {
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let opts = common::fast_watchdog(60_000);
    let rt = common::start_watchdog_runtime(store.clone(), &opts).await;
    let client = rt.client();

    client.start_orchestration("wd-1", watchdog::ORCHESTRATION_NAME, "1").await.unwrap();
    assert!(
        common::wait_for_custom_status(store.clone(), "wd-1", |s| s.contains(watchdog::MSG_WAITING), 5_000).await,
        "watchdog never reached the race"
    );
    let waiting: WatchdogStatus = client.get_custom_status("wd-1").await.unwrap().unwrap();
    assert_eq!(waiting.task_name, "1");
    assert!(waiting.next_execution_time.is_some());

    client.raise_event("wd-1", watchdog::STOP_EVENT, "").await.unwrap();
    let status = client
        .wait_for_orchestration("wd-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "stopped".into() });

    let final_status: WatchdogStatus = client.get_custom_status("wd-1").await.unwrap().unwrap();
    assert_eq!(final_status.message, watchdog::MSG_CANCELLED);
    assert_eq!(final_status.next_execution_time, None);

    let hist = store.read("wd-1").await.unwrap();
    let activities = hist
        .iter()
        .filter(|e| matches!(e, Event::ActivityCompleted { result: Ok(_), .. }))
        .count();
    assert_eq!(activities, 3);
    rt.shutdown().await;
}

#[tokio::test]
async fn stop_during_sleep_cancels_the_pending_timer() {
    let recorder = Arc::new(common::InstrumentedStore::new(Arc::new(InMemoryHistoryStore::default())));
    let store = recorder.clone() as Arc<dyn HistoryStore>;
    let opts = common::fast_watchdog(1_500);
    let rt = common::start_watchdog_runtime(store.clone(), &opts).await;
    let client = rt.client();

    client.start_orchestration("wd-cancel", watchdog::ORCHESTRATION_NAME, "4").await.unwrap();
    assert!(
        common::wait_for_custom_status(store.clone(), "wd-cancel", |s| s.contains(watchdog::MSG_WAITING), 5_000).await,
        "watchdog never reached the race"
    );
    client.raise_event("wd-cancel", watchdog::STOP_EVENT, "").await.unwrap();
    let status = client
        .wait_for_orchestration("wd-cancel", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "stopped".into() });

    // Outlive the original deadline
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    let enqueued = recorder.enqueued();
    let cancels = enqueued
        .iter()
        .filter(|(kind, item)| *kind == QueueKind::Timer && matches!(item, WorkItem::TimerCancel { seq: 4, .. }))
        .count();
    let fired = enqueued
        .iter()
        .filter(|(_, item)| matches!(item, WorkItem::TimerFired { .. }))
        .count();
    assert_eq!(cancels, 1);
    assert_eq!(fired, 0, "cancelled timer still fired");
    rt.shutdown().await;
}

#[tokio::test]
async fn sleeping_watchdog_continues_after_restart_fs() {
    let td = tempfile::tempdir().unwrap();
    let opts = common::fast_watchdog(300);

    let store1 = Arc::new(FsHistoryStore::new(td.path(), true)) as Arc<dyn HistoryStore>;
    let rt1 = common::start_watchdog_runtime(store1.clone(), &opts).await;
    rt1.client()
        .start_orchestration("wd-restart", watchdog::ORCHESTRATION_NAME, "5")
        .await
        .unwrap();
    assert!(
        common::wait_for_history(
            store1.clone(),
            "wd-restart",
            |h| h.iter().any(|e| matches!(e, Event::TimerCreated { .. })),
            5_000
        )
        .await
    );
    // Let the timer dispatcher take the schedule before the crash
    tokio::time::sleep(Duration::from_millis(50)).await;
    rt1.shutdown().await;

    let store2 = Arc::new(FsHistoryStore::new(td.path(), false)) as Arc<dyn HistoryStore>;
    let rt2 = common::start_watchdog_runtime(store2.clone(), &opts).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store2.latest_execution_id("wd-restart").await.unwrap().unwrap_or(0) < 2 {
        assert!(tokio::time::Instant::now() < deadline, "timer was lost across the restart");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(matches!(
        store2.read("wd-restart").await.unwrap().first(),
        Some(Event::OrchestrationContinued { input, .. }) if input == "5"
    ));

    let client = rt2.client();
    client.raise_event("wd-restart", watchdog::STOP_EVENT, "").await.unwrap();
    let status = client
        .wait_for_orchestration("wd-restart", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "stopped".into() });
    rt2.shutdown().await;
}

#[tokio::test]
async fn continuation_keeps_history_bounded() {
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let opts = common::fast_watchdog(30);
    let rt = common::start_watchdog_runtime(store.clone(), &opts).await;
    let client = rt.client();

    client.start_orchestration("wd-loop", watchdog::ORCHESTRATION_NAME, "7").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let exec = store.latest_execution_id("wd-loop").await.unwrap().unwrap_or(0);
        if exec >= 4 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "stuck at execution {exec}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let hist = store.read("wd-loop").await.unwrap();
    // Continued + 3 stage pairs + timer pair at most
    assert!(hist.len() <= 9, "history grew to {} events", hist.len());
    assert!(matches!(
        hist.first(),
        Some(Event::OrchestrationContinued { input, .. }) if input == "7"
    ));

    client.raise_event("wd-loop", watchdog::STOP_EVENT, "").await.unwrap();
    let status = client
        .wait_for_orchestration("wd-loop", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "stopped".into() });
    rt.shutdown().await;
}

#[tokio::test]
async fn stop_raised_before_the_race_still_halts() {
    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let mut opts = common::fast_watchdog(60_000);
    opts.stage_delay = Duration::from_millis(100);
    let rt = common::start_watchdog_runtime(store.clone(), &opts).await;
    let client = rt.client();

    client.start_orchestration("wd-early", watchdog::ORCHESTRATION_NAME, "2").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            "wd-early",
            |h| h.iter().any(|e| matches!(e, Event::ActivityScheduled { .. })),
            2_000
        )
        .await
    );
    client.raise_event("wd-early", watchdog::STOP_EVENT, "").await.unwrap();

    let status = client
        .wait_for_orchestration("wd-early", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "stopped".into() });
    let hist = store.read("wd-early").await.unwrap();
    assert!(!hist.iter().any(|e| matches!(e, Event::TimerFired { .. })));
    rt.shutdown().await;
}

#[tokio::test]
async fn failing_stage_fails_the_instance() {
    use dtf_watchdog::runtime::registry::ActivityRegistry;
    use dtf_watchdog::runtime::Runtime;
    use dtf_watchdog::OrchestrationRegistry;

    let store = Arc::new(InMemoryHistoryStore::default()) as Arc<dyn HistoryStore>;
    let opts = common::fast_watchdog(60_000);
    let activities = ActivityRegistry::builder()
        .register(watchdog::STAGE_ACTIVITY, |stage: String| async move {
            if stage == "Stage 2" {
                Err(format!("{stage} exploded"))
            } else {
                Ok(stage)
            }
        })
        .build();
    let orchestrations = watchdog::register_orchestration(OrchestrationRegistry::builder(), &opts).build();
    let rt = Runtime::start_with_options(store.clone(), Arc::new(activities), orchestrations, common::fast_runtime_options())
        .await;

    let handle = rt
        .clone()
        .start_orchestration("wd-fail", watchdog::ORCHESTRATION_NAME, "3")
        .await
        .unwrap();
    let (hist, out) = handle.await.unwrap();
    assert_eq!(out, Err("Stage 2 exploded".to_string()));
    assert!(matches!(hist.last(), Some(Event::OrchestrationFailed { .. })));
    assert_eq!(
        rt.get_orchestration_status("wd-fail").await.unwrap(),
        OrchestrationStatus::Failed { error: "Stage 2 exploded".into() }
    );
    rt.shutdown().await;
}
