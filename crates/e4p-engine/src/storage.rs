//! Artifact storage lifecycle: allocation, commit/discard, TTL sweep
//!
//! Artifacts live under a single root directory and are named by opaque
//! UUIDs, so concurrent tasks never collide and download tokens never
//! carry a guessable filesystem path. Retention is enforced by a periodic
//! sweep independent of token expiry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use e4p_core::error::{E4pError, E4pResult};

/// A freshly allocated artifact slot.
///
/// The path does not exist until a producer writes it; `commit` verifies
/// the write happened, `discard` removes whatever is there.
#[derive(Debug, Clone)]
pub struct ArtifactHandle {
    pub id: String,
    pub path: PathBuf,
}

pub struct StorageLifecycle {
    root: PathBuf,
}

impl StorageLifecycle {
    pub fn new(root: &Path) -> E4pResult<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| E4pError::Storage(format!("creating {}: {e}", root.display())))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reserve a fresh artifact id and path.
    pub fn allocate(&self) -> ArtifactHandle {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = self.root.join(&id);
        ArtifactHandle { id, path }
    }

    /// Finalize an artifact: the producer must have written the file.
    pub async fn commit(&self, handle: &ArtifactHandle) -> E4pResult<String> {
        match tokio::fs::metadata(&handle.path).await {
            Ok(meta) if meta.is_file() => {
                debug!(artifact = %handle.id, bytes = meta.len(), "artifact committed");
                Ok(handle.id.clone())
            }
            _ => Err(E4pError::Storage(format!(
                "commit of absent artifact {}",
                handle.id
            ))),
        }
    }

    /// Remove a handle's output, best-effort. Used on task failure.
    pub async fn discard(&self, handle: &ArtifactHandle) {
        if let Err(e) = tokio::fs::remove_file(&handle.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(artifact = %handle.id, "discard failed: {e}");
            }
        }
    }

    /// Map an artifact id back to its path, if it still exists.
    ///
    /// Ids are strict UUID strings; anything else (path traversal
    /// attempts included) resolves to nothing.
    pub fn resolve(&self, id: &str) -> Option<PathBuf> {
        let parsed = uuid::Uuid::try_parse(id).ok()?;
        let path = self.root.join(parsed.simple().to_string());
        path.is_file().then_some(path)
    }

    /// Remove a committed artifact by id, best-effort.
    pub async fn remove(&self, id: &str) {
        if let Some(path) = self.resolve(id) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(artifact = %id, "remove failed: {e}");
            }
        }
    }

    /// Remove artifacts older than `ttl` by mtime. Per-file failures are
    /// logged and retried on the next sweep, never fatal.
    pub async fn sweep(&self, ttl: Duration) -> usize {
        let mut removed = 0usize;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), "sweep cannot list storage: {e}");
                return 0;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            // `.part` files are a worker's in-flight staging output; the
            // stream layer removes or renames them itself.
            if path.extension().is_some_and(|ext| ext == "part") {
                continue;
            }
            let age = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(mtime) => mtime.elapsed().unwrap_or_default(),
                Err(e) => {
                    warn!(path = %path.display(), "sweep stat failed: {e}");
                    continue;
                }
            };
            if age >= ttl {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!(path = %path.display(), "swept expired artifact");
                        removed += 1;
                    }
                    Err(e) => warn!(path = %path.display(), "sweep remove failed: {e}"),
                }
            }
        }

        if removed > 0 {
            info!(removed, "storage sweep complete");
        }
        removed
    }

    /// Periodic sweep loop with an explicit stop signal.
    pub async fn run_sweeper(&self, interval: Duration, ttl: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("storage sweeper stopped");
                    return;
                }
                () = tokio::time::sleep(interval) => {
                    self.sweep(ttl).await;
                }
            }
        }
    }
}

/// Strip a caller-supplied filename down to something safe to restore.
///
/// Basename only, reserved characters replaced, length capped at 255
/// bytes, empty and dot names rejected.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim()
        .to_string();

    let mut cleaned: String = base
        .chars()
        .map(|c| {
            if matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*') || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    while cleaned.len() > 255 {
        cleaned.pop();
    }

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "unnamed_file".to_string()
    } else {
        cleaned
    }
}
