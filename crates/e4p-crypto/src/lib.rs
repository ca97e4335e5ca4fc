//! e4p-crypto: password-based streaming file encryption
//!
//! Pipeline: password → Argon2id key → per-chunk AEAD → E4P container
//!
//! Container layout:
//! ```text
//! "E4P1" || u32 LE header length || JSON header || framed ciphertext chunks
//! ```
//!
//! Each ciphertext frame is `u32 LE length || ciphertext || 16-byte tag`.
//! Chunk nonces are derived from the per-file base nonce by XORing the
//! chunk index into its trailing 8 bytes; the AAD binds chunk position,
//! the final-chunk flag, and a digest of the serialized header, so
//! reordering, truncation, and header edits all fail authentication.

pub mod aead;
pub mod container;
pub mod kdf;
pub mod stream;

pub use aead::AeadCipher;
pub use container::{ContainerCodec, ContainerHeader};
pub use kdf::{derive_key, generate_salt, DerivedKey, KdfCosts};
pub use stream::{ProgressFn, StreamProcessor};

/// Symmetric key length in bytes (256-bit) for both algorithms.
pub const KEY_SIZE: usize = 32;

/// Poly1305 / GCM authentication tag length.
pub const TAG_SIZE: usize = 16;

/// Salt length generated for new containers (headers with >= 16 accepted).
pub const SALT_SIZE: usize = 32;
