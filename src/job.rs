use std::{
    collections::HashMap,
    path::PathBuf,
    process::Child,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::error::{KaravaError, KaravaResult};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub uuid::Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Init,
    Bundling,
    Selecting,
    Rendering,
    RenderingFg,
    Compositing,
    Done,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }
}

/// The client-visible state of one render job, read by status polling.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    /// 0..=100, monotonically non-decreasing until a terminal state.
    pub progress: u8,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobSnapshot {
    pub fn init(id: JobId) -> Self {
        Self {
            id,
            progress: 0,
            status: JobStatus::Init,
            output_path: None,
            error_message: None,
        }
    }
}

/// Keyed job-state storage. Single writer per key (the owning worker), any
/// number of concurrent readers; only the map itself needs locking. The
/// store is injected so the backing primitive stays swappable.
pub trait JobStore: Send + Sync {
    fn set(&self, snapshot: JobSnapshot);
    fn get(&self, id: &JobId) -> Option<JobSnapshot>;
    fn delete(&self, id: &JobId) -> bool;
    /// Evict terminal entries older than `older_than`. Returns the number
    /// of evicted jobs.
    fn sweep(&self, older_than: Duration) -> usize;
}

struct StoredJob {
    snapshot: JobSnapshot,
    terminal_at: Option<Instant>,
}

/// Mutex-guarded map store. Terminal states are sticky: once a job is
/// `done`, `error` or `cancelled`, later writes are dropped, which lets the
/// cancel path win races against the worker's own terminal write.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, StoredJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for InMemoryJobStore {
    fn set(&self, snapshot: JobSnapshot) {
        let mut jobs = self.jobs.lock().expect("job store poisoned");
        if let Some(existing) = jobs.get(&snapshot.id)
            && existing.snapshot.status.is_terminal()
        {
            tracing::debug!(id = %snapshot.id, "dropping write to terminal job");
            return;
        }
        let terminal_at = snapshot.status.is_terminal().then(Instant::now);
        jobs.insert(
            snapshot.id,
            StoredJob {
                snapshot,
                terminal_at,
            },
        );
    }

    fn get(&self, id: &JobId) -> Option<JobSnapshot> {
        self.jobs
            .lock()
            .expect("job store poisoned")
            .get(id)
            .map(|j| j.snapshot.clone())
    }

    fn delete(&self, id: &JobId) -> bool {
        self.jobs
            .lock()
            .expect("job store poisoned")
            .remove(id)
            .is_some()
    }

    fn sweep(&self, older_than: Duration) -> usize {
        let mut jobs = self.jobs.lock().expect("job store poisoned");
        let before = jobs.len();
        jobs.retain(|_, j| match j.terminal_at {
            Some(at) => at.elapsed() < older_than,
            None => true,
        });
        before - jobs.len()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RegistryConfig {
    /// How long terminal entries stay queryable. `None` disables eviction.
    pub terminal_ttl: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            terminal_ttl: Some(Duration::from_secs(3600)),
        }
    }
}

/// Progress/status bookkeeping for all jobs, on top of an injected store.
pub struct JobRegistry {
    store: Box<dyn JobStore>,
    config: RegistryConfig,
}

impl JobRegistry {
    pub fn new(store: Box<dyn JobStore>, config: RegistryConfig) -> Self {
        Self { store, config }
    }

    pub fn in_memory(config: RegistryConfig) -> Self {
        Self::new(Box::new(InMemoryJobStore::new()), config)
    }

    pub fn create(&self, id: JobId) {
        self.store.set(JobSnapshot::init(id));
    }

    pub fn get(&self, id: &JobId) -> KaravaResult<JobSnapshot> {
        self.store
            .get(id)
            .ok_or_else(|| KaravaError::not_found(id.to_string()))
    }

    /// Record a stage transition with the stage's floor progress.
    pub fn set_stage(&self, id: &JobId, status: JobStatus, progress: u8) {
        if let Some(mut snapshot) = self.store.get(id) {
            snapshot.status = status;
            snapshot.progress = snapshot.progress.max(progress).min(100);
            self.store.set(snapshot);
        }
    }

    /// Raise progress within the current stage. Lower values are ignored so
    /// reported progress never regresses.
    pub fn set_progress(&self, id: &JobId, progress: u8) {
        if let Some(mut snapshot) = self.store.get(id)
            && !snapshot.status.is_terminal()
            && progress > snapshot.progress
        {
            snapshot.progress = progress.min(100);
            self.store.set(snapshot);
        }
    }

    pub fn finish_done(&self, id: &JobId, output_path: PathBuf) {
        if let Some(mut snapshot) = self.store.get(id) {
            snapshot.progress = 100;
            snapshot.status = JobStatus::Done;
            snapshot.output_path = Some(output_path);
            self.store.set(snapshot);
        }
    }

    pub fn finish_error(&self, id: &JobId, message: String) {
        if let Some(mut snapshot) = self.store.get(id) {
            snapshot.progress = 0;
            snapshot.status = JobStatus::Error;
            snapshot.error_message = Some(message);
            self.store.set(snapshot);
        }
    }

    pub fn finish_cancelled(&self, id: &JobId) {
        if let Some(mut snapshot) = self.store.get(id) {
            snapshot.progress = 0;
            snapshot.status = JobStatus::Cancelled;
            self.store.set(snapshot);
        }
    }

    /// Evict expired terminal entries per the configured TTL. Called
    /// opportunistically on submission.
    pub fn sweep_expired(&self) {
        if let Some(ttl) = self.config.terminal_ttl {
            let evicted = self.store.sweep(ttl);
            if evicted > 0 {
                tracing::debug!(evicted, "evicted expired terminal jobs");
            }
        }
    }
}

/// Cooperative cancellation trigger for one in-flight job, with a slot for
/// the external muxing process so cancellation can kill it directly instead
/// of waiting for the next checkpoint.
#[derive(Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    child: Mutex<Option<Child>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Abort if cancellation has been signalled. Placed immediately before
    /// each suspension point (renderer calls, subprocess waits, fs ops).
    pub fn checkpoint(&self) -> KaravaResult<()> {
        if self.is_cancelled() {
            return Err(KaravaError::Cancelled);
        }
        Ok(())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let mut slot = self.child.lock().expect("cancel token poisoned");
        if let Some(child) = slot.as_mut() {
            if let Err(err) = child.kill() {
                tracing::warn!(%err, "failed to kill in-flight subprocess");
            }
        }
    }

    /// Register the spawned subprocess. Kills it immediately when the token
    /// was already triggered between spawn and registration.
    pub fn attach_child(&self, mut child: Child) {
        if self.is_cancelled() {
            let _ = child.kill();
        }
        *self.child.lock().expect("cancel token poisoned") = Some(child);
    }

    /// Take the registered subprocess back for waiting.
    pub fn detach_child(&self) -> Option<Child> {
        self.child.lock().expect("cancel token poisoned").take()
    }
}

/// Live cancel handles, keyed by job id. Entries exist only while the job
/// is in flight.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<JobId, std::sync::Arc<CancelToken>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: JobId) -> std::sync::Arc<CancelToken> {
        let token = std::sync::Arc::new(CancelToken::new());
        self.tokens
            .lock()
            .expect("cancel registry poisoned")
            .insert(id, token.clone());
        token
    }

    /// Remove and return the handle, if the job is still in flight.
    pub fn take(&self, id: &JobId) -> Option<std::sync::Arc<CancelToken>> {
        self.tokens
            .lock()
            .expect("cancel registry poisoned")
            .remove(id)
    }

    pub fn remove(&self, id: &JobId) {
        self.tokens
            .lock()
            .expect("cancel registry poisoned")
            .remove(id);
    }
}
