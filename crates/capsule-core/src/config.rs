use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CapsuleError, CapsuleResult};

/// Lowest PBKDF2 iteration count accepted for room-key derivation
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// Default chunk size for transfer and vault storage (256 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Top-level configuration (loaded from capsule.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsuleConfig {
    pub log: LogConfig,
    pub crypto: CryptoConfig,
    pub signaling: SignalingConfig,
    pub transfer: TransferConfig,
    pub vault: VaultConfig,
}

impl CapsuleConfig {
    /// Reject values that would weaken the key hierarchy or break chunking.
    pub fn validate(&self) -> CapsuleResult<()> {
        self.crypto.validate()?;
        if self.transfer.chunk_size == 0 {
            return Err(CapsuleError::Config("transfer.chunk_size must be > 0".into()));
        }
        if self.vault.chunk_size == 0 {
            return Err(CapsuleError::Config("vault.chunk_size must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Password-based KDF used to turn the passphrase into the room key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfAlgorithm {
    Pbkdf2Sha256,
    Argon2id,
}

/// Room-key derivation configuration.
///
/// Both peers must agree on every field here, otherwise the same passphrase
/// yields different room keys and nothing decrypts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// KDF algorithm (default: pbkdf2-sha256)
    pub kdf: KdfAlgorithm,
    /// PBKDF2 iterations (default: 200000, minimum 100000)
    pub pbkdf2_iterations: u32,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// Fixed, public application salt (not a secret)
    pub app_salt: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kdf: KdfAlgorithm::Pbkdf2Sha256,
            pbkdf2_iterations: 200_000,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            app_salt: "capsule:v1".into(),
        }
    }
}

impl CryptoConfig {
    pub fn validate(&self) -> CapsuleResult<()> {
        if self.kdf == KdfAlgorithm::Pbkdf2Sha256 && self.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(CapsuleError::Config(format!(
                "crypto.pbkdf2_iterations = {} is below the floor of {MIN_PBKDF2_ITERATIONS}",
                self.pbkdf2_iterations
            )));
        }
        if self.app_salt.is_empty() {
            return Err(CapsuleError::Config("crypto.app_salt must not be empty".into()));
        }
        Ok(())
    }
}

/// A STUN/TURN server handed to the host transport as-is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Upper bound on candidate gathering before the blob is emitted anyway
    pub gather_timeout_ms: u64,
    /// Label of the data channel opened by the offerer
    pub channel_label: String,
    /// ICE servers passed to the host transport
    pub ice_servers: Vec<IceServer>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            gather_timeout_ms: 1200,
            channel_label: "data".into(),
            ice_servers: vec![IceServer {
                urls: vec![
                    "stun:stun.l.google.com:19302".into(),
                    "stun:stun.cloudflare.com:3478".into(),
                ],
                username: None,
                credential: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Plaintext bytes per file-chunk frame (default: 256 KiB)
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Storage backend for the vault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultBackend {
    /// Local filesystem directory
    Fs,
    /// Process-private in-memory store (lost on exit)
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub backend: VaultBackend,
    /// Vault root directory (fs backend only)
    pub root: PathBuf,
    /// Plaintext bytes per stored chunk (default: 256 KiB)
    pub chunk_size: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            backend: VaultBackend::Fs,
            root: PathBuf::from("~/.local/share/capsule/vault"),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}
