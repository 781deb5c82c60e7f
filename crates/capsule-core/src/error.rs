use thiserror::Error;

pub type CapsuleResult<T> = Result<T, CapsuleError>;

#[derive(Debug, Error)]
pub enum CapsuleError {
    /// An operation needed the room key but no passphrase has been set.
    #[error("room key required: set a passphrase first")]
    SecretRequired,

    #[error("malformed signaling blob: {0}")]
    MalformedBlob(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// AEAD tag check failed. Never carries any decrypted bytes.
    #[error("authentication failed: wrong key or corrupted data")]
    AuthenticationFailed,

    #[error("not connected: data channel is not open")]
    NotConnected,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
