//! The recurring watchdog orchestration.
//!
//! Each execution runs the configured stages as activities, then races a
//! durable timer against a `"stop"` event. The timer continues the instance
//! as new with the same input; the stop event completes it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::runtime::registry::ActivityRegistryBuilder;
use crate::runtime::OrchestrationRegistryBuilder;
use crate::{OrchestrationContext, durable_info};

pub const ORCHESTRATION_NAME: &str = "Watchdog";
pub const STAGE_ACTIVITY: &str = "StartActivity";
pub const STOP_EVENT: &str = "stop";

pub const MSG_WAITING: &str = "Waiting stop or next execution";
pub const MSG_CANCELLED: &str = "Operation cancelled while sleeping";

/// Watchdog timing and stage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogOptions {
    /// Sleep between the last stage and the next execution.
    pub delay: Duration,
    /// Simulated async work at the end of each stage activity.
    pub stage_delay: Duration,
    /// Size of the CPU-bound loop each stage activity runs.
    pub stage_iterations: u64,
    pub stages: Vec<String>,
}

impl Default for WatchdogOptions {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            stage_delay: Duration::from_secs(1),
            stage_iterations: 1_000_000,
            stages: vec!["Stage 1".into(), "Stage 2".into(), "Stage 3".into()],
        }
    }
}

impl WatchdogOptions {
    /// Defaults overridden by environment variables.
    ///
    /// - `WATCHDOG_DELAY_SECS`: seconds between executions (default: 10)
    /// - `WATCHDOG_STAGE_DELAY_MS`: per-stage sleep in ms (default: 1000)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            delay: std::env::var("WATCHDOG_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.delay),
            stage_delay: std::env::var("WATCHDOG_STAGE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.stage_delay),
            ..default
        }
    }
}

/// Status snapshot published by the watchdog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogStatus {
    pub task_name: String,
    pub message: String,
    pub next_execution_time: Option<DateTime<Utc>>,
}

/// Register the watchdog orchestration under `ORCHESTRATION_NAME`.
pub fn register_orchestration(
    builder: OrchestrationRegistryBuilder,
    options: &WatchdogOptions,
) -> OrchestrationRegistryBuilder {
    let options = Arc::new(options.clone());
    builder.register(ORCHESTRATION_NAME, move |ctx: OrchestrationContext, input: String| {
        let options = options.clone();
        async move { run(ctx, input, &options).await }
    })
}

/// Register the stage activity under `STAGE_ACTIVITY`.
pub fn register_activities(builder: ActivityRegistryBuilder, options: &WatchdogOptions) -> ActivityRegistryBuilder {
    let iterations = options.stage_iterations;
    let stage_delay = options.stage_delay;
    builder.register(STAGE_ACTIVITY, move |stage: String| async move {
        let sum = tokio::task::spawn_blocking(move || {
            (0..iterations).fold(0u64, |acc, i| std::hint::black_box(acc.wrapping_add(i)))
        })
        .await
        .map_err(|e| format!("stage {stage} worker failed: {e}"))?;
        tokio::time::sleep(stage_delay).await;
        debug!(stage=%stage, sum, "stage done");
        Ok(stage)
    })
}

/// One watchdog execution. Returns `"stopped"` when halted by the stop event.
pub async fn run(ctx: OrchestrationContext, input: String, options: &WatchdogOptions) -> Result<String, String> {
    durable_info!(ctx, task = %input, "watchdog execution started");
    let mut status = WatchdogStatus {
        task_name: input.clone(),
        message: String::new(),
        next_execution_time: None,
    };

    for stage in &options.stages {
        status.message = format!("Executing {stage}");
        ctx.set_custom_status(&status);
        ctx.schedule_activity(STAGE_ACTIVITY, stage.clone()).into_activity().await?;
    }

    let next_ms = ctx.utc_now_ms().saturating_add(options.delay.as_millis() as u64);
    status.message = MSG_WAITING.to_string();
    status.next_execution_time = DateTime::from_timestamp_millis(next_ms as i64);
    ctx.set_custom_status(&status);

    let timer = ctx.schedule_timer_at(next_ms);
    let timer_seq = timer.seq();
    let stop = ctx.schedule_wait(STOP_EVENT);
    // Stop is listed first so it wins whenever it is present
    let (winner, _) = ctx.select_biased(vec![stop, timer]).await;
    if winner == 0 {
        durable_info!(ctx, task = %input, "stop received");
        if let Some(seq) = timer_seq {
            ctx.cancel_timer_seq(seq);
        }
        status.message = MSG_CANCELLED.to_string();
        status.next_execution_time = None;
        ctx.set_custom_status(&status);
        return Ok("stopped".to_string());
    }

    durable_info!(ctx, task = %input, "continuing as new");
    ctx.continue_as_new(input);
    Ok("continued".to_string())
}
