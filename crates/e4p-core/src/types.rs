use serde::{Deserialize, Serialize};

use crate::error::E4pError;

/// Opaque task identity (UUID v4 under the hood).
pub type TaskId = uuid::Uuid;

/// Supported AEAD algorithms.
///
/// The serialized names are part of the container format and must not
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    #[serde(rename = "XCHACHA20-POLY1305")]
    XChaCha20Poly1305,
}

impl Algorithm {
    /// Nonce length in bytes: 96-bit for AES-GCM, 192-bit for XChaCha20.
    pub fn nonce_size(self) -> usize {
        match self {
            Algorithm::Aes256Gcm => 12,
            Algorithm::XChaCha20Poly1305 => 24,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "AES-256-GCM",
            Algorithm::XChaCha20Poly1305 => "XCHACHA20-POLY1305",
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = E4pError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AES-256-GCM" => Ok(Algorithm::Aes256Gcm),
            "XCHACHA20-POLY1305" => Ok(Algorithm::XChaCha20Poly1305),
            other => Err(E4pError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an encryption task.
///
/// Transitions: `Pending → Processing → Completed | Failed`. Terminal
/// states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}
