use thiserror::Error;

pub type E4pResult<T> = Result<T, E4pError>;

/// Error taxonomy for the E4P engine.
///
/// `AuthenticationFailure` deliberately covers both "wrong password" and
/// "tampered ciphertext" — the two must stay indistinguishable to callers.
#[derive(Debug, Error)]
pub enum E4pError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("too many files: {count} exceeds limit of {limit}")]
    TooManyFiles { count: usize, limit: usize },

    #[error("server overloaded, try again later")]
    Overloaded,

    #[error("decryption failed: wrong password or corrupted file")]
    AuthenticationFailure,

    #[error("malformed container: {0}")]
    MalformedContainer(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("download token expired")]
    TokenExpired,

    #[error("download token invalid")]
    TokenInvalid,

    #[error("task cancelled")]
    Cancelled,

    #[error("task not found")]
    TaskNotFound,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl E4pError {
    /// Message safe to surface to an untrusted caller.
    ///
    /// Internal detail (paths, io error strings) is collapsed so the
    /// failure granularity visible outside stays coarse.
    pub fn user_message(&self) -> String {
        match self {
            E4pError::Io(_) | E4pError::Storage(_) => "internal storage error".to_string(),
            other => other.to_string(),
        }
    }
}
