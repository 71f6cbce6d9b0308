use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};

use super::{HistoryStore, ProviderError, QueueKind, WorkItem, dedupe_completions};
use crate::Event;

const KINDS: [QueueKind; 3] = [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer];

/// Filesystem-backed store.
///
/// Layout under `root`:
/// - `{instance}/{execution_id}.jsonl`: one event per line, latest execution only
/// - `{instance}/status.json`: last published status snapshot
/// - `{orch,work,timer}-queue.jsonl`: pending work items
/// - `.locks/{orch,work,timer}/{token}.lock`: peek-locked items
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    cap: usize,
    // Serializes read-modify-write cycles on the queue files
    queue_lock: std::sync::Arc<Mutex<()>>,
    token_counter: std::sync::Arc<AtomicU64>,
}

impl FsHistoryStore {
    /// Open a store rooted at `root`. With `reset_on_create` any existing data
    /// is deleted first; otherwise items left peek-locked by a previous process
    /// are returned to their queues.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        // best-effort create
        let _ = std::fs::create_dir_all(&path);
        let store = Self {
            root: path,
            cap: 1024,
            queue_lock: Default::default(),
            token_counter: Default::default(),
        };
        for kind in KINDS {
            let _ = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(store.queue_file(kind));
            if !reset_on_create {
                store.recover_locked(kind);
            }
        }
        store
    }

    /// Create a store with a custom history cap (useful for tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let mut s = Self::new(root, reset_on_create);
        s.cap = cap;
        s
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }
    fn exec_path(&self, instance: &str, execution_id: u64) -> PathBuf {
        self.inst_root(instance).join(format!("{execution_id}.jsonl"))
    }
    fn status_path(&self, instance: &str) -> PathBuf {
        self.inst_root(instance).join("status.json")
    }
    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/work"),
            QueueKind::Timer => self.root.join(".locks/timer"),
        }
    }
    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }
    fn queue_file(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join("orch-queue.jsonl"),
            QueueKind::Worker => self.root.join("work-queue.jsonl"),
            QueueKind::Timer => self.root.join("timer-queue.jsonl"),
        }
    }

    fn new_token(&self) -> String {
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let pid = std::process::id();
        let n = self.token_counter.fetch_add(1, Ordering::Relaxed);
        format!("{now_ns:x}-{pid:x}-{n}")
    }

    /// Move lock sidecars left by a crashed process back to the head of the queue.
    fn recover_locked(&self, kind: QueueKind) {
        let Ok(rd) = std::fs::read_dir(self.lock_dir(kind)) else {
            return;
        };
        let mut recovered = Vec::new();
        for ent in rd.flatten() {
            let path = ent.path();
            if let Ok(data) = std::fs::read_to_string(&path)
                && let Ok(item) = serde_json::from_str::<WorkItem>(&data)
            {
                recovered.push(item);
            }
            let _ = std::fs::remove_file(&path);
        }
        if recovered.is_empty() {
            return;
        }
        tracing::info!(queue = ?kind, count = recovered.len(), "recovered peek-locked work items");
        let qf = self.queue_file(kind);
        let mut items = parse_items(&std::fs::read_to_string(&qf).unwrap_or_default());
        for item in recovered.into_iter().rev() {
            if !items.contains(&item) {
                items.insert(0, item);
            }
        }
        if let Err(e) = write_items_sync(&qf, &items) {
            tracing::warn!(queue = ?kind, error = %e, "failed to rewrite queue during lock recovery");
        }
    }

    async fn read_queue(&self, kind: QueueKind) -> Result<Vec<WorkItem>, ProviderError> {
        match fs::read_to_string(self.queue_file(kind)).await {
            Ok(content) => Ok(parse_items(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(ProviderError::io("read_queue", &e)),
        }
    }

    async fn write_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), ProviderError> {
        let qf = self.queue_file(kind);
        let tmp = qf.with_extension("jsonl.tmp");
        fs::write(&tmp, encode_lines(items, "write_queue")?)
            .await
            .map_err(|e| ProviderError::io("write_queue", &e))?;
        fs::rename(&tmp, &qf)
            .await
            .map_err(|e| ProviderError::io("write_queue", &e))
    }

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        Ok(parse_events(&self.read_execution_raw(instance, execution_id).await?))
    }

    async fn read_execution_raw(&self, instance: &str, execution_id: u64) -> Result<String, ProviderError> {
        match fs::read_to_string(self.exec_path(instance, execution_id)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(ProviderError::io("read", &e)),
        }
    }
}

fn parse_events(content: &str) -> Vec<Event> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str::<Event>(l).ok())
        .collect()
}

fn parse_items(content: &str) -> Vec<WorkItem> {
    content
        .lines()
        .filter_map(|l| serde_json::from_str::<WorkItem>(l).ok())
        .collect()
}

fn encode_lines<T: serde::Serialize>(items: &[T], op: &str) -> Result<String, ProviderError> {
    let mut buf = String::new();
    for it in items {
        let line = serde_json::to_string(it).map_err(|e| ProviderError::permanent(op, e.to_string()))?;
        buf.push_str(&line);
        buf.push('\n');
    }
    Ok(buf)
}

fn write_items_sync(qf: &Path, items: &[WorkItem]) -> Result<(), ProviderError> {
    let tmp = qf.with_extension("jsonl.tmp");
    std::fs::write(&tmp, encode_lines(items, "write_queue")?).map_err(|e| ProviderError::io("write_queue", &e))?;
    std::fs::rename(&tmp, qf).map_err(|e| ProviderError::io("write_queue", &e))
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        match self.latest_execution_id(instance).await? {
            Some(latest) => self.read_execution(instance, latest).await,
            None => Ok(Vec::new()),
        }
    }

    async fn append(&self, instance: &str, execution_id: u64, new_events: Vec<Event>) -> Result<(), ProviderError> {
        let latest = self
            .latest_execution_id(instance)
            .await?
            .ok_or_else(|| ProviderError::permanent("append", format!("instance not found: {instance}")))?;
        if latest != execution_id {
            return Err(ProviderError::permanent(
                "append",
                format!("stale execution {execution_id} for {instance} (latest {latest})"),
            ));
        }
        let raw = self.read_execution_raw(instance, latest).await?;
        let existing = parse_events(&raw);
        let fresh = dedupe_completions(&existing, new_events);
        if fresh.is_empty() {
            return Ok(());
        }
        if existing.len() + fresh.len() > self.cap {
            return Err(ProviderError::permanent(
                "append",
                format!(
                    "history cap exceeded (cap={}, have={}, append={})",
                    self.cap,
                    existing.len(),
                    fresh.len()
                ),
            ));
        }
        // One write per append so a crash cannot leave half a batch behind
        let mut buf = encode_lines(&fresh, "append")?;
        if !raw.is_empty() && !raw.ends_with('\n') {
            // Close a torn trailing line so it stays a single skipped record
            buf.insert(0, '\n');
        }
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.exec_path(instance, latest))
            .await
            .map_err(|e| ProviderError::io("append", &e))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| ProviderError::io("append", &e))?;
        file.flush().await.map_err(|e| ProviderError::io("append", &e))?;
        Ok(())
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        let mut rd = match fs::read_dir(self.inst_root(instance)).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ProviderError::io("latest_execution_id", &e)),
        };
        let mut max_eid = 0u64;
        while let Some(ent) = rd
            .next_entry()
            .await
            .map_err(|e| ProviderError::io("latest_execution_id", &e))?
        {
            if let Some(name) = ent.file_name().to_str()
                && let Some(stem) = name.strip_suffix(".jsonl")
                && let Ok(id) = stem.parse::<u64>()
            {
                max_eid = max_eid.max(id);
            }
        }
        Ok((max_eid > 0).then_some(max_eid))
    }

    async fn create_new_execution(&self, instance: &str, first_event: Event) -> Result<u64, ProviderError> {
        let prev = self.latest_execution_id(instance).await?.unwrap_or(0);
        let next = prev + 1;
        fs::create_dir_all(self.inst_root(instance))
            .await
            .map_err(|e| ProviderError::io("create_new_execution", &e))?;
        let buf = encode_lines(std::slice::from_ref(&first_event), "create_new_execution")?;
        let path = self.exec_path(instance, next);
        let tmp = path.with_extension("jsonl.tmp");
        fs::write(&tmp, buf)
            .await
            .map_err(|e| ProviderError::io("create_new_execution", &e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| ProviderError::io("create_new_execution", &e))?;
        // Only the latest execution is kept
        for old in 1..=prev {
            let _ = fs::remove_file(self.exec_path(instance, old)).await;
        }
        Ok(next)
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        fs::remove_dir_all(self.inst_root(instance))
            .await
            .map_err(|e| ProviderError::io("remove_instance", &e))
    }

    /// List instances by scanning instance directories.
    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut out = Vec::new();
        let mut rd = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(ProviderError::io("list_instances", &e)),
        };
        while let Some(ent) = rd
            .next_entry()
            .await
            .map_err(|e| ProviderError::io("list_instances", &e))?
        {
            let is_dir = ent.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if let Some(name) = ent.file_name().to_str()
                && is_dir
                && !name.starts_with('.')
            {
                out.push(name.to_string());
            }
        }
        Ok(out)
    }

    async fn reset(&self) {
        let _guard = self.queue_lock.lock().await;
        let _ = fs::remove_dir_all(&self.root).await;
        let _ = fs::create_dir_all(&self.root).await;
    }

    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await.unwrap_or_default() {
            let Ok(Some(eid)) = self.latest_execution_id(&inst).await else {
                continue;
            };
            out.push_str(&format!("instance={inst} exec#{eid}\n"));
            for ev in self.read_execution(&inst, eid).await.unwrap_or_default() {
                out.push_str(&format!("  {ev:#?}\n"));
            }
        }
        out
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        let _guard = self.queue_lock.lock().await;
        let mut items = self.read_queue(kind).await?;
        if items.contains(&item) {
            return Ok(());
        }
        items.push(item);
        self.write_queue(kind, &items).await
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _guard = self.queue_lock.lock().await;
        let mut items = self.read_queue(kind).await.ok()?;
        if items.is_empty() {
            return None;
        }
        let first = items.remove(0);
        // Persist the lock before removing the item so a crash in between duplicates rather than loses it
        let token = self.new_token();
        let line = serde_json::to_string(&first).ok()?;
        fs::create_dir_all(self.lock_dir(kind)).await.ok()?;
        fs::write(self.lock_path(kind, &token), line).await.ok()?;
        if let Err(e) = self.write_queue(kind, &items).await {
            tracing::warn!(queue = ?kind, error = %e, "failed to pop work item");
            let _ = fs::remove_file(self.lock_path(kind, &token)).await;
            return None;
        }
        Some((first, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        match fs::remove_file(self.lock_path(kind, token)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProviderError::io("ack", &e)),
        }
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), ProviderError> {
        let _guard = self.queue_lock.lock().await;
        let path = self.lock_path(kind, token);
        let data = match fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(ProviderError::io("abandon", &e)),
        };
        let item: WorkItem =
            serde_json::from_str(&data).map_err(|e| ProviderError::permanent("abandon", e.to_string()))?;
        let mut items = self.read_queue(kind).await?;
        items.insert(0, item);
        self.write_queue(kind, &items).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| ProviderError::io("abandon", &e))
    }

    async fn set_custom_status(&self, instance: &str, status: Option<String>) -> Result<(), ProviderError> {
        let path = self.status_path(instance);
        match status {
            Some(s) => {
                fs::create_dir_all(self.inst_root(instance))
                    .await
                    .map_err(|e| ProviderError::io("set_custom_status", &e))?;
                let tmp = path.with_extension("json.tmp");
                fs::write(&tmp, s)
                    .await
                    .map_err(|e| ProviderError::io("set_custom_status", &e))?;
                fs::rename(&tmp, &path)
                    .await
                    .map_err(|e| ProviderError::io("set_custom_status", &e))
            }
            None => match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(ProviderError::io("set_custom_status", &e)),
            },
        }
    }

    async fn get_custom_status(&self, instance: &str) -> Result<Option<String>, ProviderError> {
        match fs::read_to_string(self.status_path(instance)).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::io("get_custom_status", &e)),
        }
    }
}
