use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{E4pError, E4pResult};

/// Top-level engine configuration (loaded from e4p.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct E4pConfig {
    pub limits: LimitsConfig,
    pub kdf: KdfConfig,
    pub storage: StorageConfig,
    pub tokens: TokenConfig,
    pub tasks: TaskConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum size of a single input file in MiB (default: 2048)
    pub max_file_size_mib: u64,
    /// Maximum number of files per task (default: 10)
    pub max_files_per_task: usize,
    /// Maximum tasks in `processing` simultaneously (default: 2)
    pub max_concurrency: usize,
    /// Maximum tasks waiting in `pending` (0 = unbounded queue)
    pub queue_depth: usize,
}

/// Argon2id cost parameters used for every encryption.
///
/// Decryption re-reads the costs from the container header, so lowering
/// these only affects newly encrypted files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Memory cost in KiB (default: 262144 = 256 MiB)
    pub memory_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism lanes (default: 2)
    pub parallelism: u32,
    /// Derived key length in bytes (default: 32)
    pub key_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding staged uploads and result artifacts
    pub root_dir: PathBuf,
    /// Seconds between cleanup sweeps (default: 300)
    pub clean_interval_secs: u64,
    /// Artifact retention in seconds, independent of token expiry (default: 3600)
    pub artifact_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Download token lifetime in seconds (default: 900)
    pub ttl_secs: u64,
    /// HMAC-SHA256 signing secret; must be set before serving
    pub secret: String,
    /// Expire tokens on first successful download (default: false)
    pub one_time: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Seconds a finished task stays pollable before eviction (default: 86400)
    pub finished_ttl_secs: u64,
    /// Enable the watchdog that cancels stuck tasks (default: false)
    pub watchdog: bool,
    /// Watchdog base allowance in seconds (default: 60)
    pub watchdog_floor_secs: u64,
    /// Extra watchdog seconds granted per MiB of declared input (default: 2)
    pub watchdog_secs_per_mib: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size_mib: 2048,
            max_files_per_task: 10,
            max_concurrency: 2,
            queue_depth: 0,
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            memory_kib: 262_144,
            time_cost: 3,
            parallelism: 2,
            key_len: 32,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/tmp/e4p"),
            clean_interval_secs: 300,
            artifact_ttl_secs: 3600,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 900,
            secret: String::new(),
            one_time: false,
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            finished_ttl_secs: 86_400,
            watchdog: false,
            watchdog_floor_secs: 60,
            watchdog_secs_per_mib: 2,
        }
    }
}

impl E4pConfig {
    /// Reject configurations that cannot serve safely.
    pub fn validate(&self) -> E4pResult<()> {
        if self.limits.max_concurrency == 0 {
            return Err(E4pError::InvalidParameters(
                "limits.max_concurrency must be at least 1".into(),
            ));
        }
        if self.limits.max_files_per_task == 0 {
            return Err(E4pError::InvalidParameters(
                "limits.max_files_per_task must be at least 1".into(),
            ));
        }
        if self.kdf.memory_kib < 1024 {
            return Err(E4pError::InvalidParameters(
                "kdf.memory_kib below the 1024 KiB safety floor".into(),
            ));
        }
        if self.kdf.time_cost == 0 || self.kdf.parallelism == 0 {
            return Err(E4pError::InvalidParameters(
                "kdf.time_cost and kdf.parallelism must be positive".into(),
            ));
        }
        if self.tokens.secret.len() < 32 {
            return Err(E4pError::InvalidParameters(
                "tokens.secret must be at least 32 bytes".into(),
            ));
        }
        Ok(())
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.limits.max_file_size_mib * 1024 * 1024
    }
}
