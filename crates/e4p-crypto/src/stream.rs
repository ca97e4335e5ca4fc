//! Streaming encryption/decryption over the E4P container format
//!
//! Ciphertext body framing (stable across implementations):
//! ```text
//! repeat: u32 LE frame length || ciphertext || 16-byte tag
//! ```
//! Frame length covers ciphertext + tag and must not exceed
//! `MAX_FRAME_LEN`. The final chunk is sealed with the last-flag set (see
//! aead.rs), so a stream cut at a frame boundary still fails
//! authentication. A zero-byte file carries exactly one empty final
//! frame.
//!
//! Memory use is bounded by the chunk size regardless of file size.
//! Output is written to a `.part` sibling and renamed only on full
//! success; any failure discards the partial file.

use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use e4p_core::error::{E4pError, E4pResult};
use e4p_core::types::Algorithm;

use crate::aead::AeadCipher;
use crate::container::{ContainerCodec, ContainerHeader};
use crate::kdf::{derive_key, generate_salt, DerivedKey, KdfCosts};
use crate::TAG_SIZE;

/// Progress callback: (bytes_processed, bytes_total)
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Default plaintext chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest chunk an encoder may produce (8 MiB of plaintext).
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Frame length cap enforced on decode, derived from `MAX_CHUNK_SIZE`.
pub const MAX_FRAME_LEN: usize = MAX_CHUNK_SIZE + TAG_SIZE;

/// Drives the container codec and AEAD cipher over file-sized inputs.
#[derive(Clone)]
pub struct StreamProcessor {
    chunk_size: usize,
    costs: KdfCosts,
    key_len: usize,
}

impl StreamProcessor {
    pub fn new(costs: KdfCosts, key_len: usize) -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            costs,
            key_len,
        }
    }

    /// Override the chunk size (tests use small chunks to exercise
    /// multi-chunk paths cheaply). Clamped to `1..=MAX_CHUNK_SIZE`.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// Encrypt `input` into an E4P container at `output`.
    ///
    /// Derives the key once (off the async dispatch path), then streams
    /// fixed-size chunks through the AEAD. Returns the written header.
    pub async fn encrypt_file(
        &self,
        input: &Path,
        output: &Path,
        password: &SecretString,
        algorithm: Algorithm,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> E4pResult<ContainerHeader> {
        let staging = staging_path(output);
        let result = self
            .encrypt_to_staging(input, &staging, password, algorithm, progress, cancel)
            .await;

        match result {
            Ok(header) => match tokio::fs::rename(&staging, output).await {
                Ok(()) => Ok(header),
                Err(e) => {
                    let _ = tokio::fs::remove_file(&staging).await;
                    Err(e.into())
                }
            },
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                Err(e)
            }
        }
    }

    async fn encrypt_to_staging(
        &self,
        input: &Path,
        staging: &Path,
        password: &SecretString,
        algorithm: Algorithm,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> E4pResult<ContainerHeader> {
        let in_file = File::open(input).await?;
        let total = in_file.metadata().await?.len();
        let orig_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed_file".to_string());

        let salt = generate_salt();
        let nonce = AeadCipher::generate_nonce(algorithm);
        let key = self.derive_blocking(password, &salt).await?;
        let cipher = AeadCipher::new(algorithm, &key, &nonce)?;

        let header = ContainerHeader::new(algorithm, &salt, &nonce, &orig_name, total, self.costs);
        let serialized = ContainerCodec::encode(&header)?;
        let digest = ContainerCodec::binding_digest(&serialized);

        let mut reader = BufReader::new(in_file);
        let mut writer = BufWriter::new(File::create(staging).await?);
        writer.write_all(&serialized).await?;

        let chunk = self.chunk_size as u64;
        let nchunks = std::cmp::max(1, total.div_ceil(chunk));
        let mut buf = vec![0u8; self.chunk_size];
        let mut done: u64 = 0;

        for index in 0..nchunks {
            if cancel.is_cancelled() {
                return Err(E4pError::Cancelled);
            }

            let want = std::cmp::min(chunk, total - done) as usize;
            read_full(&mut reader, &mut buf[..want]).await?;

            let last = index == nchunks - 1;
            let sealed = cipher.seal_chunk(index, last, &digest, &buf[..want])?;
            writer.write_all(&(sealed.len() as u32).to_le_bytes()).await?;
            writer.write_all(&sealed).await?;

            done += want as u64;
            if let Some(cb) = progress {
                cb(done, total);
            }
        }

        writer.flush().await?;
        debug!(
            file = %orig_name,
            bytes = total,
            chunks = nchunks,
            %algorithm,
            "encrypted"
        );
        Ok(header)
    }

    /// Decrypt an E4P container at `input` into `output`.
    ///
    /// Any authentication failure anywhere in the stream aborts the whole
    /// operation and discards partial output. Wrong password is surfaced
    /// as the same `AuthenticationFailure` as tampered ciphertext.
    pub async fn decrypt_file(
        &self,
        input: &Path,
        output: &Path,
        password: &SecretString,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> E4pResult<ContainerHeader> {
        let staging = staging_path(output);
        let result = self
            .decrypt_to_staging(input, &staging, password, progress, cancel)
            .await;

        match result {
            Ok(header) => match tokio::fs::rename(&staging, output).await {
                Ok(()) => Ok(header),
                Err(e) => {
                    let _ = tokio::fs::remove_file(&staging).await;
                    Err(e.into())
                }
            },
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                Err(e)
            }
        }
    }

    async fn decrypt_to_staging(
        &self,
        input: &Path,
        staging: &Path,
        password: &SecretString,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> E4pResult<ContainerHeader> {
        let mut reader = BufReader::new(File::open(input).await?);
        let (header, raw) = ContainerCodec::read_header(&mut reader).await?;
        header.validate(None)?;
        let digest = ContainerCodec::binding_digest(&raw);

        let algorithm = header.algorithm()?;
        let salt = header.decode_salt()?;
        let nonce = header.decode_nonce()?;
        let total = header.orig_size;

        let key = {
            let costs = header.kdf_params;
            self.derive_blocking_with(password, &salt, costs).await?
        };
        let cipher = AeadCipher::new(algorithm, &key, &nonce)?;

        let mut writer = BufWriter::new(File::create(staging).await?);
        let mut index: u64 = 0;
        let mut produced: u64 = 0;

        // One frame of lookahead: the final chunk is only identified by
        // end-of-stream, and its AAD last-flag must match.
        let Some(mut current) = read_frame(&mut reader).await? else {
            return Err(E4pError::MalformedContainer(
                "container has no ciphertext body".into(),
            ));
        };

        loop {
            if cancel.is_cancelled() {
                return Err(E4pError::Cancelled);
            }

            let next = read_frame(&mut reader).await?;
            let last = next.is_none();

            let plaintext = cipher.open_chunk(index, last, &digest, &current)?;
            writer.write_all(&plaintext).await?;
            produced += plaintext.len() as u64;

            if let Some(cb) = progress {
                cb(produced.min(total), total);
            }

            index += 1;
            match next {
                Some(frame) => current = frame,
                None => break,
            }
        }

        if produced != total {
            // All tags verified but the authenticated header disagrees
            // with the stream: produced by a broken encoder.
            warn!(declared = total, produced, "plaintext size mismatch");
            return Err(E4pError::MalformedContainer(
                "plaintext size does not match header".into(),
            ));
        }

        writer.flush().await?;
        debug!(file = %header.orig_name, bytes = produced, chunks = index, "decrypted");
        Ok(header)
    }

    /// Read container metadata without deriving a key or touching the
    /// ciphertext body.
    pub async fn peek_header(&self, input: &Path) -> E4pResult<ContainerHeader> {
        let mut reader = BufReader::new(File::open(input).await?);
        let (header, _) = ContainerCodec::read_header(&mut reader).await?;
        header.validate(None)?;
        Ok(header)
    }

    async fn derive_blocking(
        &self,
        password: &SecretString,
        salt: &[u8],
    ) -> E4pResult<DerivedKey> {
        self.derive_blocking_with(password, salt, self.costs).await
    }

    /// Run Argon2id on the blocking pool so the latency-dominant
    /// derivation never stalls status polls or sibling tasks.
    async fn derive_blocking_with(
        &self,
        password: &SecretString,
        salt: &[u8],
        costs: KdfCosts,
    ) -> E4pResult<DerivedKey> {
        let password = SecretString::from(password.expose_secret().to_string());
        let salt = salt.to_vec();
        let key_len = self.key_len;
        tokio::task::spawn_blocking(move || derive_key(&password, &salt, &costs, key_len))
            .await
            .map_err(|e| E4pError::Storage(format!("key derivation task failed: {e}")))?
    }
}

fn staging_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "output".into());
    name.push(".part");
    output.with_file_name(name)
}

/// Fill `buf` completely from the reader.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> E4pResult<()> {
    reader.read_exact(buf).await?;
    Ok(())
}

/// Read one `u32 LE length || payload` frame.
///
/// Returns `None` on clean end-of-stream at a frame boundary. A partial
/// length prefix, partial payload, or out-of-bounds length is
/// `MalformedContainer`.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> E4pResult<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = reader.read(&mut len_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(E4pError::MalformedContainer("truncated frame length".into()));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len < TAG_SIZE {
        return Err(E4pError::MalformedContainer(format!(
            "frame length {len} shorter than the authentication tag"
        )));
    }
    if len > MAX_FRAME_LEN {
        return Err(E4pError::MalformedContainer(format!(
            "frame length {len} exceeds {MAX_FRAME_LEN}"
        )));
    }

    let mut frame = vec![0u8; len];
    reader
        .read_exact(&mut frame)
        .await
        .map_err(|_| E4pError::MalformedContainer("truncated frame".into()))?;
    Ok(Some(frame))
}
