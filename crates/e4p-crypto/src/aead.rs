//! Per-chunk AEAD encryption: AES-256-GCM or XChaCha20-Poly1305
//!
//! Chunk nonce derivation: the per-file base nonce (random, stored in the
//! header) has its trailing 8 bytes XORed with the chunk index (u64 LE),
//! so no nonce repeats within a stream while the header carries a single
//! value.
//!
//! AAD layout per chunk:
//! ```text
//! chunk_index (8 bytes BE) || last_flag (1 byte) || header digest (32 bytes)
//! ```
//!
//! The index prevents reordering, the last-flag makes truncation fail
//! authentication, and the BLAKE3 digest of the serialized header makes
//! every header byte tamper-evident even where it does not influence the
//! derived key.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;

use e4p_core::error::{E4pError, E4pResult};
use e4p_core::types::Algorithm;

use crate::kdf::DerivedKey;
use crate::KEY_SIZE;

enum CipherKind {
    Aes(Box<Aes256Gcm>),
    XChaCha(Box<XChaCha20Poly1305>),
}

/// AEAD context for one file: key + base nonce + algorithm.
pub struct AeadCipher {
    kind: CipherKind,
    base_nonce: Vec<u8>,
}

impl AeadCipher {
    pub fn new(algorithm: Algorithm, key: &DerivedKey, base_nonce: &[u8]) -> E4pResult<Self> {
        if key.len() != KEY_SIZE {
            return Err(E4pError::InvalidParameters(format!(
                "{algorithm} requires a {KEY_SIZE}-byte key, got {}",
                key.len()
            )));
        }
        if base_nonce.len() != algorithm.nonce_size() {
            return Err(E4pError::InvalidParameters(format!(
                "{algorithm} requires a {}-byte nonce, got {}",
                algorithm.nonce_size(),
                base_nonce.len()
            )));
        }

        let kind = match algorithm {
            Algorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
                    .map_err(|e| E4pError::InvalidParameters(format!("AES key: {e}")))?;
                CipherKind::Aes(Box::new(cipher))
            }
            Algorithm::XChaCha20Poly1305 => {
                let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
                    .map_err(|e| E4pError::InvalidParameters(format!("XChaCha key: {e}")))?;
                CipherKind::XChaCha(Box::new(cipher))
            }
        };

        Ok(Self {
            kind,
            base_nonce: base_nonce.to_vec(),
        })
    }

    /// Generate a fresh random base nonce for `algorithm`.
    pub fn generate_nonce(algorithm: Algorithm) -> Vec<u8> {
        let mut nonce = vec![0u8; algorithm.nonce_size()];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt one chunk. Returns `ciphertext || tag`.
    pub fn seal_chunk(
        &self,
        chunk_index: u64,
        last: bool,
        header_digest: &[u8; 32],
        plaintext: &[u8],
    ) -> E4pResult<Vec<u8>> {
        let nonce = self.chunk_nonce(chunk_index);
        let aad = build_aad(chunk_index, last, header_digest);
        let payload = Payload {
            msg: plaintext,
            aad: &aad,
        };

        match &self.kind {
            CipherKind::Aes(cipher) => cipher.encrypt(aes_gcm::Nonce::from_slice(&nonce), payload),
            CipherKind::XChaCha(cipher) => cipher.encrypt(XNonce::from_slice(&nonce), payload),
        }
        .map_err(|_| E4pError::InvalidParameters("chunk exceeds AEAD message limit".into()))
    }

    /// Decrypt and verify one chunk.
    ///
    /// Fails with `AuthenticationFailure` on any tag mismatch — wrong
    /// key, tampered ciphertext, wrong position, and truncation are
    /// intentionally indistinguishable here.
    pub fn open_chunk(
        &self,
        chunk_index: u64,
        last: bool,
        header_digest: &[u8; 32],
        ciphertext: &[u8],
    ) -> E4pResult<Vec<u8>> {
        let nonce = self.chunk_nonce(chunk_index);
        let aad = build_aad(chunk_index, last, header_digest);
        let payload = Payload {
            msg: ciphertext,
            aad: &aad,
        };

        match &self.kind {
            CipherKind::Aes(cipher) => cipher.decrypt(aes_gcm::Nonce::from_slice(&nonce), payload),
            CipherKind::XChaCha(cipher) => cipher.decrypt(XNonce::from_slice(&nonce), payload),
        }
        .map_err(|_| E4pError::AuthenticationFailure)
    }

    fn chunk_nonce(&self, chunk_index: u64) -> Vec<u8> {
        let mut nonce = self.base_nonce.clone();
        let counter = chunk_index.to_le_bytes();
        let offset = nonce.len() - 8;
        for (i, byte) in counter.iter().enumerate() {
            nonce[offset + i] ^= byte;
        }
        nonce
    }
}

fn build_aad(chunk_index: u64, last: bool, header_digest: &[u8; 32]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + 1 + 32);
    aad.extend_from_slice(&chunk_index.to_be_bytes());
    aad.push(u8::from(last));
    aad.extend_from_slice(header_digest);
    aad
}
