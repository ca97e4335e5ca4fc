//! Task orchestration: bounded-concurrency encryption jobs with
//! pollable progress
//!
//! Lifecycle per task: `pending → processing → completed | failed`.
//! A fair semaphore of `max_concurrency` permits gates entry into
//! `processing`; excess submissions queue FIFO (or fail `Overloaded`
//! past the configured queue depth). The registry holds one lock per
//! task so status polls of one task never serialize behind another
//! task's worker; per-file byte counters are atomics updated from the
//! streaming progress callback without touching the task lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use secrecy::SecretString;
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use e4p_core::config::E4pConfig;
use e4p_core::error::{E4pError, E4pResult};
use e4p_core::types::{Algorithm, TaskId, TaskStatus};
use e4p_crypto::stream::{ProgressFn, StreamProcessor};

use crate::storage::{sanitize_filename, StorageLifecycle};
use crate::tokens::TokenService;

/// One input file of a submission, already staged on local disk.
#[derive(Debug, Clone)]
pub struct SubmitFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

struct FileSlot {
    name: String,
    input: PathBuf,
    size: u64,
    done: Arc<AtomicU64>,
    artifact: Option<String>,
    download_token: Option<String>,
}

struct TaskRecord {
    status: TaskStatus,
    files: Vec<FileSlot>,
    error: Option<String>,
    created_unix: u64,
    completed_unix: Option<u64>,
    finished_at: Option<Instant>,
    cancel: CancellationToken,
}

/// Per-file view returned by status polls.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub name: String,
    pub size: u64,
    /// 0–100
    pub progress: f64,
    pub download_token: Option<String>,
}

/// Task view returned by status polls.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// 0–100 across all files, weighted by size
    pub progress: f64,
    pub files: Vec<FileReport>,
    pub error: Option<String>,
    pub created_at: u64,
    pub completed_at: Option<u64>,
}

pub struct TaskOrchestrator {
    registry: RwLock<HashMap<TaskId, Arc<RwLock<TaskRecord>>>>,
    semaphore: Arc<Semaphore>,
    pending: AtomicUsize,
    queue_depth: usize,
    max_files: usize,
    max_file_bytes: u64,
    watchdog: Option<(u64, u64)>,
    processor: StreamProcessor,
    storage: Arc<StorageLifecycle>,
    tokens: Arc<TokenService>,
}

impl TaskOrchestrator {
    pub fn new(
        config: &E4pConfig,
        processor: StreamProcessor,
        storage: Arc<StorageLifecycle>,
        tokens: Arc<TokenService>,
    ) -> Self {
        let watchdog = config.tasks.watchdog.then_some((
            config.tasks.watchdog_floor_secs,
            config.tasks.watchdog_secs_per_mib,
        ));
        Self {
            registry: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.limits.max_concurrency)),
            pending: AtomicUsize::new(0),
            queue_depth: config.limits.queue_depth,
            max_files: config.limits.max_files_per_task,
            max_file_bytes: config.max_file_size_bytes(),
            watchdog,
            processor,
            storage,
            tokens,
        }
    }

    /// Admit and schedule a new encryption task.
    ///
    /// Admission failures happen before any task exists; on success the
    /// task is `pending` and a worker has been spawned.
    pub async fn submit(
        self: &Arc<Self>,
        files: Vec<SubmitFile>,
        password: SecretString,
        algorithm: Algorithm,
    ) -> E4pResult<TaskId> {
        if files.is_empty() {
            return Err(E4pError::InvalidParameters(
                "at least one file is required".into(),
            ));
        }
        if files.len() > self.max_files {
            return Err(E4pError::TooManyFiles {
                count: files.len(),
                limit: self.max_files,
            });
        }
        for file in &files {
            if file.size > self.max_file_bytes {
                return Err(E4pError::PayloadTooLarge {
                    size: file.size,
                    limit: self.max_file_bytes,
                });
            }
        }
        if self.queue_depth > 0 && self.pending.load(Ordering::SeqCst) >= self.queue_depth {
            return Err(E4pError::Overloaded);
        }

        let task_id = TaskId::new_v4();
        let total_bytes: u64 = files.iter().map(|f| f.size).sum();
        let cancel = CancellationToken::new();
        let record = Arc::new(RwLock::new(TaskRecord {
            status: TaskStatus::Pending,
            files: files
                .into_iter()
                .map(|f| FileSlot {
                    name: f.name,
                    input: f.path,
                    size: f.size,
                    done: Arc::new(AtomicU64::new(0)),
                    artifact: None,
                    download_token: None,
                })
                .collect(),
            error: None,
            created_unix: now_unix(),
            completed_unix: None,
            finished_at: None,
            cancel: cancel.clone(),
        }));

        self.registry.write().await.insert(task_id, record.clone());
        self.pending.fetch_add(1, Ordering::SeqCst);

        if let Some((floor, per_mib)) = self.watchdog {
            let deadline = floor + per_mib * total_bytes.div_ceil(1024 * 1024);
            spawn_watchdog(record.clone(), task_id, Duration::from_secs(deadline));
        }

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_task(task_id, record, password, algorithm).await;
        });

        info!(task = %task_id, "task submitted");
        Ok(task_id)
    }

    /// Snapshot a task's state. Safe to call while its worker runs.
    pub async fn status(&self, task_id: TaskId) -> E4pResult<TaskReport> {
        let record = {
            let registry = self.registry.read().await;
            registry.get(&task_id).cloned()
        }
        .ok_or(E4pError::TaskNotFound)?;

        let record = record.read().await;
        let total: u64 = record.files.iter().map(|f| f.size).sum();
        let done: u64 = record
            .files
            .iter()
            .map(|f| f.done.load(Ordering::Relaxed))
            .sum();

        let progress = match record.status {
            TaskStatus::Completed => 100.0,
            _ if total == 0 => 0.0,
            _ => (done as f64 / total as f64) * 100.0,
        };

        Ok(TaskReport {
            task_id,
            status: record.status,
            progress,
            files: record
                .files
                .iter()
                .map(|f| FileReport {
                    name: f.name.clone(),
                    size: f.size,
                    progress: if f.size == 0 {
                        if f.artifact.is_some() { 100.0 } else { 0.0 }
                    } else {
                        (f.done.load(Ordering::Relaxed) as f64 / f.size as f64) * 100.0
                    },
                    download_token: f.download_token.clone(),
                })
                .collect(),
            error: record.error.clone(),
            created_at: record.created_unix,
            completed_at: record.completed_unix,
        })
    }

    /// Request cancellation. The worker aborts at the next chunk
    /// boundary; a still-pending task aborts before processing starts.
    pub async fn cancel(&self, task_id: TaskId) -> E4pResult<()> {
        let record = {
            let registry = self.registry.read().await;
            registry.get(&task_id).cloned()
        }
        .ok_or(E4pError::TaskNotFound)?;

        record.read().await.cancel.cancel();
        Ok(())
    }

    /// Evict finished tasks older than `older_than`. Returns the number
    /// evicted. Driven by the engine's periodic sweep, or directly by
    /// tests.
    pub async fn evict_finished(&self, older_than: Duration) -> usize {
        let mut expired = Vec::new();
        {
            let registry = self.registry.read().await;
            for (id, record) in registry.iter() {
                let record = record.read().await;
                if let Some(finished) = record.finished_at {
                    if finished.elapsed() >= older_than {
                        expired.push(*id);
                    }
                }
            }
        }

        let mut registry = self.registry.write().await;
        let mut evicted = 0;
        for id in expired {
            if registry.remove(&id).is_some() {
                debug!(task = %id, "evicted finished task");
                evicted += 1;
            }
        }
        evicted
    }

    /// Number of tasks currently in `processing`.
    pub async fn processing_count(&self) -> usize {
        let registry = self.registry.read().await;
        let mut count = 0;
        for record in registry.values() {
            if record.read().await.status == TaskStatus::Processing {
                count += 1;
            }
        }
        count
    }

    async fn run_task(
        self: Arc<Self>,
        task_id: TaskId,
        record: Arc<RwLock<TaskRecord>>,
        password: SecretString,
        algorithm: Algorithm,
    ) {
        // FIFO admission: waiters get permits in submission order.
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(task = %task_id, "semaphore closed, dropping task");
                return;
            }
        };
        self.pending.fetch_sub(1, Ordering::SeqCst);

        let cancel = record.read().await.cancel.clone();
        if cancel.is_cancelled() {
            finish(&record, TaskStatus::Failed, Some(E4pError::Cancelled.to_string())).await;
            self.cleanup_inputs(&record).await;
            drop(permit);
            return;
        }

        {
            let mut rec = record.write().await;
            rec.status = TaskStatus::Processing;
        }
        debug!(task = %task_id, %algorithm, "task processing");

        // Snapshot the worklist so encryption never holds the task lock.
        let worklist: Vec<(String, PathBuf, Arc<AtomicU64>)> = {
            let rec = record.read().await;
            rec.files
                .iter()
                .map(|f| (f.name.clone(), f.input.clone(), f.done.clone()))
                .collect()
        };

        let mut committed: Vec<String> = Vec::new();
        for (index, (name, input, done)) in worklist.into_iter().enumerate() {
            let handle = self.storage.allocate();
            let progress: ProgressFn = {
                let done = done.clone();
                Box::new(move |bytes, _total| done.store(bytes, Ordering::Relaxed))
            };

            let result = self
                .processor
                .encrypt_file(&input, &handle.path, &password, algorithm, Some(&progress), &cancel)
                .await;

            match result {
                Ok(_header) => {
                    let artifact = match self.storage.commit(&handle).await {
                        Ok(id) => id,
                        Err(e) => {
                            self.fail_task(task_id, &record, &committed, &handle, e).await;
                            drop(permit);
                            return;
                        }
                    };
                    let filename = format!("{}.e4p", sanitize_filename(&name));
                    let token = match self.tokens.issue(&artifact, &filename) {
                        Ok(token) => token,
                        Err(e) => {
                            self.fail_task(task_id, &record, &committed, &handle, e).await;
                            drop(permit);
                            return;
                        }
                    };
                    committed.push(artifact.clone());
                    let mut rec = record.write().await;
                    rec.files[index].artifact = Some(artifact);
                    rec.files[index].download_token = Some(token);
                }
                Err(e) => {
                    // Fail-fast: one bad file fails the whole task and
                    // nothing of it stays downloadable.
                    self.fail_task(task_id, &record, &committed, &handle, e).await;
                    drop(permit);
                    return;
                }
            }
        }

        finish(&record, TaskStatus::Completed, None).await;
        self.cleanup_inputs(&record).await;
        info!(task = %task_id, "task completed");
        drop(permit);
    }

    async fn fail_task(
        &self,
        task_id: TaskId,
        record: &Arc<RwLock<TaskRecord>>,
        committed: &[String],
        current: &crate::storage::ArtifactHandle,
        error: E4pError,
    ) {
        self.storage.discard(current).await;
        for artifact in committed {
            self.storage.remove(artifact).await;
        }
        warn!(task = %task_id, error = %error, "task failed");
        finish(record, TaskStatus::Failed, Some(error.user_message())).await;
        self.cleanup_inputs(record).await;
    }

    /// Staged uploads are single-use; drop them once the task is done.
    async fn cleanup_inputs(&self, record: &Arc<RwLock<TaskRecord>>) {
        let inputs: Vec<PathBuf> = {
            let rec = record.read().await;
            rec.files.iter().map(|f| f.input.clone()).collect()
        };
        for input in inputs {
            if let Err(e) = tokio::fs::remove_file(&input).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %input.display(), "input cleanup failed: {e}");
                }
            }
        }
    }
}

async fn finish(record: &Arc<RwLock<TaskRecord>>, status: TaskStatus, error: Option<String>) {
    let mut rec = record.write().await;
    if rec.status.is_terminal() {
        return;
    }
    rec.status = status;
    rec.error = error;
    rec.completed_unix = Some(now_unix());
    rec.finished_at = Some(Instant::now());
    // Terminal means no more work: waking the token here releases the
    // watchdog timer instead of letting it sleep out its deadline.
    rec.cancel.cancel();
}

fn spawn_watchdog(record: Arc<RwLock<TaskRecord>>, task_id: TaskId, deadline: Duration) {
    tokio::spawn(async move {
        let cancel = record.read().await.cancel.clone();
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(deadline) => {
                let rec = record.read().await;
                if !rec.status.is_terminal() {
                    warn!(task = %task_id, ?deadline, "watchdog deadline exceeded, cancelling");
                    rec.cancel.cancel();
                }
            }
        }
    });
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
