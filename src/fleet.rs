//! Fleet lifecycle controller: starts and stops many watchdog instances
//! named `"<prefix>:<index>"`, skipping instances already in the requested
//! state.

use std::collections::HashSet;
use std::future::Future;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::client::{Client, ClientError};
use crate::runtime::OrchestrationStatus;
use crate::watchdog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetOptions {
    pub instance_prefix: String,
    /// Max concurrent query-then-act operations per fleet request.
    pub concurrency: usize,
    pub orchestration_name: String,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            instance_prefix: "FunctionTest".to_string(),
            concurrency: 16,
            orchestration_name: watchdog::ORCHESTRATION_NAME.to_string(),
        }
    }
}

impl FleetOptions {
    /// Defaults overridden by environment variables.
    ///
    /// - `WATCHDOG_INSTANCE_PREFIX`: instance id prefix (default: FunctionTest)
    /// - `WATCHDOG_FLEET_CONCURRENCY`: concurrent operations (default: 16)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            instance_prefix: std::env::var("WATCHDOG_INSTANCE_PREFIX")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(default.instance_prefix),
            concurrency: std::env::var("WATCHDOG_FLEET_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(default.concurrency),
            orchestration_name: default.orchestration_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetError {
    MissingCount,
    InvalidCount(String),
    NoInstancesStarted { requested: usize },
    NoWatchdogsStopped { requested: usize },
}

impl std::fmt::Display for FleetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FleetError::MissingCount => f.write_str("no instance count"),
            FleetError::InvalidCount(raw) => write!(f, "instance count should be an integer: {raw:?}"),
            FleetError::NoInstancesStarted { .. } => f.write_str("no instances started"),
            FleetError::NoWatchdogsStopped { .. } => f.write_str("no watchdogs stopped"),
        }
    }
}

impl std::error::Error for FleetError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartReport {
    pub started: usize,
    pub requested: usize,
}

impl std::fmt::Display for StartReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} instances started ({} requested)", self.started, self.requested)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    pub stopped: usize,
    pub requested: usize,
}

impl std::fmt::Display for StopReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} instances stopped ({} requested)", self.stopped, self.requested)
    }
}

/// Parse a requested instance count as given by a caller (e.g. a query parameter).
pub fn parse_count(raw: Option<&str>) -> Result<usize, FleetError> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty()).ok_or(FleetError::MissingCount)?;
    raw.parse().map_err(|_| FleetError::InvalidCount(raw.to_string()))
}

#[derive(Clone)]
pub struct FleetController {
    client: Client,
    options: FleetOptions,
}

impl FleetController {
    pub fn new(client: Client, options: FleetOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &FleetOptions {
        &self.options
    }

    pub fn instance_id(&self, index: usize) -> String {
        format!("{}:{}", self.options.instance_prefix, index)
    }

    /// Ids `prefix:0` to `prefix:count-1`.
    pub fn instance_ids(&self, count: usize) -> Vec<String> {
        (0..count).map(|i| self.instance_id(i)).collect()
    }

    /// Start every id that is absent or terminal. Returns how many were started.
    pub async fn start(&self, ids: &[String]) -> usize {
        self.fan_out("start", ids, move |id| async move { self.start_one(&id).await })
            .await
    }

    /// Raise the stop event on every active id. Returns how many were signalled.
    pub async fn stop(&self, ids: &[String]) -> usize {
        self.fan_out("stop", ids, move |id| async move { self.stop_one(&id).await })
            .await
    }

    pub async fn start_fleet(&self, count: usize) -> Result<StartReport, FleetError> {
        let started = self.start(&self.instance_ids(count)).await;
        if started == 0 {
            return Err(FleetError::NoInstancesStarted { requested: count });
        }
        let report = StartReport {
            started,
            requested: count,
        };
        info!(started, requested = count, "fleet start");
        Ok(report)
    }

    pub async fn stop_fleet(&self, count: usize) -> Result<StopReport, FleetError> {
        let stopped = self.stop(&self.instance_ids(count)).await;
        if stopped == 0 {
            return Err(FleetError::NoWatchdogsStopped { requested: count });
        }
        info!(stopped, requested = count, "fleet stop");
        Ok(StopReport {
            stopped,
            requested: count,
        })
    }

    pub async fn status(&self, id: &str) -> Result<Option<watchdog::WatchdogStatus>, ClientError> {
        self.client.get_custom_status(id).await
    }

    pub async fn runtime_status(&self, id: &str) -> Result<OrchestrationStatus, ClientError> {
        self.client.get_orchestration_status(id).await
    }

    async fn start_one(&self, id: &str) -> Result<bool, ClientError> {
        let status = self.client.get_orchestration_status(id).await?;
        if status.is_active() {
            debug!(instance = id, ?status, "already active; not started");
            return Ok(false);
        }
        // Input is the index part of the id
        let input = id.rsplit(':').next().unwrap_or(id);
        match self
            .client
            .start_orchestration(id, &self.options.orchestration_name, input)
            .await
        {
            Ok(_) => {
                info!(instance = id, "started orchestration");
                Ok(true)
            }
            Err(ClientError::AlreadyActive { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn stop_one(&self, id: &str) -> Result<bool, ClientError> {
        let status = self.client.get_orchestration_status(id).await?;
        if !status.is_active() {
            debug!(instance = id, ?status, "not active; stop skipped");
            return Ok(false);
        }
        self.client.raise_event(id, watchdog::STOP_EVENT, "").await?;
        Ok(true)
    }

    /// Run `op` once per distinct id with at most `concurrency` in flight and
    /// count successes. A failing id is logged and counted as not done.
    async fn fan_out<'a, F, Fut>(&'a self, what: &str, ids: &[String], op: F) -> usize
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<bool, ClientError>> + 'a,
    {
        let semaphore = Semaphore::new(self.options.concurrency.max(1));
        let semaphore = &semaphore;
        let mut seen = HashSet::new();
        let tasks = ids.iter().filter(|id| seen.insert(*id)).map(|id| {
            let fut = op(id.clone());
            async move {
                let _permit = semaphore.acquire().await.ok();
                match fut.await {
                    Ok(done) => done,
                    Err(e) => {
                        warn!(instance=%id, op = what, error=%e, "fleet operation failed");
                        false
                    }
                }
            }
        });
        join_all(tasks).await.into_iter().filter(|done| *done).count()
    }
}
