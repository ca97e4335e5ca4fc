//! e4p-engine: task orchestration, download tokens, and storage lifecycle
//!
//! `Engine` wires the three services from an `E4pConfig` and exposes the
//! operations the request layer drives: submit an encryption job, poll
//! its status, cancel it, decrypt a container, and open a tokenized
//! download. No service is reachable as ambient global state; the host
//! process owns the `Engine` and injects it where needed.

pub mod storage;
pub mod tasks;
pub mod tokens;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::info;

use e4p_core::config::E4pConfig;
use e4p_core::error::{E4pError, E4pResult};
use e4p_core::types::{Algorithm, TaskId};
use e4p_crypto::kdf::KdfCosts;
use e4p_crypto::stream::StreamProcessor;

pub use storage::{sanitize_filename, ArtifactHandle, StorageLifecycle};
pub use tasks::{FileReport, SubmitFile, TaskOrchestrator, TaskReport};
pub use tokens::{TokenClaims, TokenService};

/// Result of a decrypt request: the plaintext artifact is committed and
/// retrievable through the returned token.
#[derive(Debug, Clone)]
pub struct DecryptOutcome {
    pub download_token: String,
    pub filename: String,
    pub size: u64,
    pub algorithm: Algorithm,
}

/// A verified download: artifact path plus the filename to offer.
#[derive(Debug, Clone)]
pub struct Download {
    pub path: PathBuf,
    pub filename: String,
}

pub struct Engine {
    config: E4pConfig,
    processor: StreamProcessor,
    storage: Arc<StorageLifecycle>,
    tokens: Arc<TokenService>,
    orchestrator: Arc<TaskOrchestrator>,
    sweeper: CancellationToken,
}

impl Engine {
    pub fn new(config: E4pConfig) -> E4pResult<Self> {
        config.validate()?;

        let costs = KdfCosts {
            memory_kib: config.kdf.memory_kib,
            time_cost: config.kdf.time_cost,
            parallelism: config.kdf.parallelism,
        };
        let processor = StreamProcessor::new(costs, config.kdf.key_len);
        let storage = Arc::new(StorageLifecycle::new(&config.storage.root_dir)?);
        let tokens = Arc::new(TokenService::new(
            &config.tokens.secret,
            config.tokens.ttl_secs,
            config.tokens.one_time,
        ));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            &config,
            processor.clone(),
            storage.clone(),
            tokens.clone(),
        ));

        Ok(Self {
            config,
            processor,
            storage,
            tokens,
            orchestrator,
            sweeper: CancellationToken::new(),
        })
    }

    pub fn storage(&self) -> &Arc<StorageLifecycle> {
        &self.storage
    }

    /// Submit an encryption job over staged input files.
    pub async fn submit(
        &self,
        files: Vec<SubmitFile>,
        password: SecretString,
        algorithm: Algorithm,
    ) -> E4pResult<TaskId> {
        self.orchestrator.submit(files, password, algorithm).await
    }

    pub async fn status(&self, task_id: TaskId) -> E4pResult<TaskReport> {
        self.orchestrator.status(task_id).await
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> E4pResult<()> {
        self.orchestrator.cancel(task_id).await
    }

    /// Decrypt a staged E4P container and stage the plaintext as a
    /// tokenized artifact.
    pub async fn decrypt(
        &self,
        input: &Path,
        password: SecretString,
    ) -> E4pResult<DecryptOutcome> {
        let header = self.processor.peek_header(input).await?;
        if header.orig_size > self.config.max_file_size_bytes() {
            return Err(E4pError::PayloadTooLarge {
                size: header.orig_size,
                limit: self.config.max_file_size_bytes(),
            });
        }

        let handle = self.storage.allocate();
        let cancel = CancellationToken::new();
        let result = self
            .processor
            .decrypt_file(input, &handle.path, &password, None, &cancel)
            .await;

        let header = match result {
            Ok(header) => header,
            Err(e) => {
                self.storage.discard(&handle).await;
                return Err(e);
            }
        };

        let artifact = self.storage.commit(&handle).await?;
        let filename = sanitize_filename(&header.orig_name);
        let download_token = self.tokens.issue(&artifact, &filename)?;

        info!(artifact = %artifact, file = %filename, "decrypt staged for download");
        Ok(DecryptOutcome {
            download_token,
            filename,
            size: header.orig_size,
            algorithm: header.algorithm()?,
        })
    }

    /// Verify (and for one-time tokens, consume) a download token and
    /// resolve its artifact.
    pub async fn open_download(&self, token: &str) -> E4pResult<Download> {
        let claims = self.tokens.redeem(token)?;
        let path = self
            .storage
            .resolve(&claims.artifact)
            .ok_or(E4pError::TokenInvalid)?;
        Ok(Download {
            path,
            filename: claims.filename,
        })
    }

    /// Start the background retention sweep (artifacts + finished tasks).
    pub fn start_sweeper(&self) {
        let storage = self.storage.clone();
        let orchestrator = self.orchestrator.clone();
        let interval = Duration::from_secs(self.config.storage.clean_interval_secs);
        let artifact_ttl = Duration::from_secs(self.config.storage.artifact_ttl_secs);
        let task_ttl = Duration::from_secs(self.config.tasks.finished_ttl_secs);
        let cancel = self.sweeper.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(interval) => {
                        storage.sweep(artifact_ttl).await;
                        orchestrator.evict_finished(task_ttl).await;
                    }
                }
            }
        });
    }

    /// Stop the background sweep. Idempotent.
    pub fn shutdown(&self) {
        self.sweeper.cancel();
    }

    /// Evict finished tasks now; exposed for deterministic tests and for
    /// hosts that schedule their own sweeps.
    pub async fn evict_finished_tasks(&self, older_than: Duration) -> usize {
        self.orchestrator.evict_finished(older_than).await
    }

    /// Tasks currently in `processing`.
    pub async fn processing_count(&self) -> usize {
        self.orchestrator.processing_count().await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}
