//! Key derivation: Argon2id password → symmetric key

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use e4p_core::error::{E4pError, E4pResult};

use crate::SALT_SIZE;

/// Argon2id cost parameters.
///
/// Serialized into the container header as `{"m":..,"t":..,"p":..}` and
/// must round-trip exactly: decryption re-derives the key from the
/// header-stored costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfCosts {
    /// Memory cost in KiB
    #[serde(rename = "m")]
    pub memory_kib: u32,
    /// Time cost (iterations)
    #[serde(rename = "t")]
    pub time_cost: u32,
    /// Parallelism lanes
    #[serde(rename = "p")]
    pub parallelism: u32,
}

impl Default for KdfCosts {
    fn default() -> Self {
        Self {
            memory_kib: 262_144,
            time_cost: 3,
            parallelism: 2,
        }
    }
}

impl KdfCosts {
    /// Reject costs outside supported ranges.
    ///
    /// The 1024 KiB memory floor keeps headers from downgrading the
    /// work factor to something brute-forceable.
    pub fn validate(&self) -> E4pResult<()> {
        if self.memory_kib < 1024 {
            return Err(E4pError::InvalidParameters(format!(
                "memory cost {} KiB below 1024 KiB floor",
                self.memory_kib
            )));
        }
        if self.time_cost < 1 {
            return Err(E4pError::InvalidParameters(
                "time cost must be at least 1".into(),
            ));
        }
        if self.parallelism < 1 {
            return Err(E4pError::InvalidParameters(
                "parallelism must be at least 1".into(),
            ));
        }
        if self.memory_kib < 8 * self.parallelism {
            return Err(E4pError::InvalidParameters(
                "memory cost must be at least 8 KiB per lane".into(),
            ));
        }
        Ok(())
    }
}

/// A derived symmetric key. Zeroized on drop.
#[derive(Clone)]
pub struct DerivedKey {
    bytes: Vec<u8>,
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a fresh random salt for a new container.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive `output_len` key bytes from a password with Argon2id v19.
///
/// Deterministic over its inputs. Running time is proportional to
/// `memory_kib * time_cost` on purpose; callers must run this off the
/// async dispatch path (see `StreamProcessor`).
pub fn derive_key(
    password: &SecretString,
    salt: &[u8],
    costs: &KdfCosts,
    output_len: usize,
) -> E4pResult<DerivedKey> {
    costs.validate()?;
    if salt.len() < 16 {
        return Err(E4pError::InvalidParameters(format!(
            "salt must be at least 16 bytes, got {}",
            salt.len()
        )));
    }
    if !(16..=64).contains(&output_len) {
        return Err(E4pError::InvalidParameters(format!(
            "key length {output_len} outside supported range 16..=64"
        )));
    }

    let params = Params::new(
        costs.memory_kib,
        costs.time_cost,
        costs.parallelism,
        Some(output_len),
    )
    .map_err(|e| E4pError::InvalidParameters(format!("argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = vec![0u8; output_len];
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| E4pError::InvalidParameters(format!("argon2 derivation: {e}")))?;

    Ok(DerivedKey { bytes: key })
}
