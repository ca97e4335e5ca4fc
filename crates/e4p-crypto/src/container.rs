//! E4P container format: magic, length-prefixed JSON header, ciphertext body
//!
//! ```text
//! bytes 0..4   = ASCII "E4P1"
//! bytes 4..8   = u32 little-endian header length L
//! bytes 8..8+L = UTF-8 JSON header
//! bytes 8+L..  = framed ciphertext chunks (see stream.rs)
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use e4p_core::error::{E4pError, E4pResult};
use e4p_core::types::Algorithm;

use crate::kdf::KdfCosts;

/// Container magic bytes.
pub const MAGIC: &[u8; 4] = b"E4P1";

/// Upper bound on the declared header length. A crafted length field must
/// not be able to trigger a large allocation.
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// The only supported key derivation identifier.
pub const KDF_ID: &str = "argon2id";

/// JSON header stored at the front of every container.
///
/// Immutable once written: the streaming layer mixes a digest of the
/// serialized header into every chunk's AAD, so any header edit fails
/// decryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerHeader {
    /// Algorithm name, one of `AES-256-GCM` / `XCHACHA20-POLY1305`
    pub alg: String,
    /// Key derivation identifier, always `argon2id`
    pub kdf: String,
    /// Argon2id costs used at encryption time
    pub kdf_params: KdfCosts,
    /// Base64 salt (32 bytes written; at least 16 accepted)
    pub salt: String,
    /// Base64 per-file base nonce, length fixed by `alg`
    pub nonce: String,
    /// Original filename, restored on decrypt
    pub orig_name: String,
    /// Original plaintext size in bytes
    pub orig_size: u64,
    /// Creation time, Unix seconds. Informational only.
    pub ts: u64,
}

impl ContainerHeader {
    pub fn new(
        algorithm: Algorithm,
        salt: &[u8],
        nonce: &[u8],
        orig_name: &str,
        orig_size: u64,
        costs: KdfCosts,
    ) -> Self {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            alg: algorithm.as_str().to_string(),
            kdf: KDF_ID.to_string(),
            kdf_params: costs,
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce),
            orig_name: orig_name.to_string(),
            orig_size,
            ts,
        }
    }

    pub fn algorithm(&self) -> E4pResult<Algorithm> {
        self.alg.parse()
    }

    pub fn decode_salt(&self) -> E4pResult<Vec<u8>> {
        BASE64
            .decode(&self.salt)
            .map_err(|_| E4pError::MalformedContainer("salt is not valid base64".into()))
    }

    pub fn decode_nonce(&self) -> E4pResult<Vec<u8>> {
        BASE64
            .decode(&self.nonce)
            .map_err(|_| E4pError::MalformedContainer("nonce is not valid base64".into()))
    }

    /// Schema validation beyond what serde enforces.
    ///
    /// `max_size` caps `orig_size` when the caller has a configured file
    /// size limit.
    pub fn validate(&self, max_size: Option<u64>) -> E4pResult<()> {
        let algorithm = self.algorithm()?;

        if self.kdf != KDF_ID {
            return Err(E4pError::MalformedContainer(format!(
                "unsupported kdf {:?}",
                self.kdf
            )));
        }
        self.kdf_params
            .validate()
            .map_err(|e| E4pError::MalformedContainer(e.user_message()))?;

        let salt = self.decode_salt()?;
        if salt.len() < 16 {
            return Err(E4pError::MalformedContainer(format!(
                "salt too short: {} bytes",
                salt.len()
            )));
        }

        let nonce = self.decode_nonce()?;
        if nonce.len() != algorithm.nonce_size() {
            return Err(E4pError::MalformedContainer(format!(
                "nonce length {} does not match {algorithm}",
                nonce.len()
            )));
        }

        if let Some(limit) = max_size {
            if self.orig_size > limit {
                return Err(E4pError::MalformedContainer(format!(
                    "declared size {} exceeds limit {limit}",
                    self.orig_size
                )));
            }
        }

        Ok(())
    }
}

/// Encoder/decoder for the container prologue (magic + length + header).
pub struct ContainerCodec;

impl ContainerCodec {
    /// Serialize a header to `MAGIC || u32 LE length || JSON`.
    pub fn encode(header: &ContainerHeader) -> E4pResult<Vec<u8>> {
        let json = serde_json::to_vec(header)
            .map_err(|e| E4pError::MalformedContainer(format!("header serialization: {e}")))?;
        if json.len() > MAX_HEADER_LEN {
            return Err(E4pError::MalformedContainer(format!(
                "header of {} bytes exceeds {MAX_HEADER_LEN}",
                json.len()
            )));
        }

        let mut out = Vec::with_capacity(8 + json.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(&json);
        Ok(out)
    }

    /// Parse a header from a byte slice. Returns the header and the
    /// number of bytes consumed.
    pub fn decode(data: &[u8]) -> E4pResult<(ContainerHeader, usize)> {
        if data.len() < 8 {
            return Err(E4pError::MalformedContainer("file too short".into()));
        }
        if &data[..4] != MAGIC {
            return Err(E4pError::MalformedContainer("wrong magic bytes".into()));
        }

        let len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if len > MAX_HEADER_LEN {
            return Err(E4pError::MalformedContainer(format!(
                "declared header length {len} exceeds {MAX_HEADER_LEN}"
            )));
        }
        if data.len() < 8 + len {
            return Err(E4pError::MalformedContainer("incomplete header".into()));
        }

        let header: ContainerHeader = serde_json::from_slice(&data[8..8 + len])
            .map_err(|e| E4pError::MalformedContainer(format!("header json: {e}")))?;
        Ok((header, 8 + len))
    }

    /// Read and parse a header from an async stream.
    ///
    /// Returns the header and the exact serialized bytes consumed, which
    /// feed the AAD binding digest. Bounds are checked before the header
    /// allocation.
    pub async fn read_header<R>(reader: &mut R) -> E4pResult<(ContainerHeader, Vec<u8>)>
    where
        R: AsyncRead + Unpin,
    {
        let mut prologue = [0u8; 8];
        reader
            .read_exact(&mut prologue)
            .await
            .map_err(|_| E4pError::MalformedContainer("file too short".into()))?;
        if &prologue[..4] != MAGIC {
            return Err(E4pError::MalformedContainer("wrong magic bytes".into()));
        }

        let len = u32::from_le_bytes([prologue[4], prologue[5], prologue[6], prologue[7]]) as usize;
        if len > MAX_HEADER_LEN {
            return Err(E4pError::MalformedContainer(format!(
                "declared header length {len} exceeds {MAX_HEADER_LEN}"
            )));
        }

        let mut raw = vec![0u8; 8 + len];
        raw[..8].copy_from_slice(&prologue);
        reader
            .read_exact(&mut raw[8..])
            .await
            .map_err(|_| E4pError::MalformedContainer("incomplete header".into()))?;

        let header: ContainerHeader = serde_json::from_slice(&raw[8..])
            .map_err(|e| E4pError::MalformedContainer(format!("header json: {e}")))?;
        Ok((header, raw))
    }

    /// Digest of the serialized header (magic and length prefix included),
    /// mixed into every chunk's AAD.
    pub fn binding_digest(serialized: &[u8]) -> [u8; 32] {
        *blake3::hash(serialized).as_bytes()
    }
}
