//! Key derivation: passphrase → room key

use argon2::{Algorithm, Argon2, Params, Version};
use capsule_core::config::{CryptoConfig, KdfAlgorithm, MIN_PBKDF2_ITERATIONS};
use capsule_core::{CapsuleError, CapsuleResult};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// The 256-bit room key shared by both peers through the passphrase.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey {
    bytes: [u8; KEY_SIZE],
}

impl RoomKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for RoomKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Password-based KDF and its cost parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KdfParams {
    Pbkdf2Sha256 {
        iterations: u32,
    },
    Argon2id {
        /// Memory cost in KiB
        mem_cost_kib: u32,
        time_cost: u32,
        parallelism: u32,
    },
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::Pbkdf2Sha256 {
            iterations: 200_000,
        }
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(cfg: &CryptoConfig) -> Self {
        match cfg.kdf {
            KdfAlgorithm::Pbkdf2Sha256 => Self::Pbkdf2Sha256 {
                iterations: cfg.pbkdf2_iterations,
            },
            KdfAlgorithm::Argon2id => Self::Argon2id {
                mem_cost_kib: cfg.argon2_mem_cost_kib,
                time_cost: cfg.argon2_time_cost,
                parallelism: cfg.argon2_parallelism,
            },
        }
    }
}

/// Derive the room key from a passphrase and the fixed application salt.
///
/// Deterministic: the same passphrase, salt and params always give the same
/// key. The salt is public; the cost parameters are what slow down offline
/// guessing, so PBKDF2 below `MIN_PBKDF2_ITERATIONS` is refused.
pub fn derive_room_key(
    passphrase: &SecretString,
    app_salt: &[u8],
    params: &KdfParams,
) -> CapsuleResult<RoomKey> {
    let mut key = [0u8; KEY_SIZE];

    match *params {
        KdfParams::Pbkdf2Sha256 { iterations } => {
            if iterations < MIN_PBKDF2_ITERATIONS {
                return Err(CapsuleError::Crypto(format!(
                    "PBKDF2 iteration count {iterations} is below the floor of {MIN_PBKDF2_ITERATIONS}"
                )));
            }
            pbkdf2::pbkdf2_hmac::<Sha256>(
                passphrase.expose_secret().as_bytes(),
                app_salt,
                iterations,
                &mut key,
            );
        }
        KdfParams::Argon2id {
            mem_cost_kib,
            time_cost,
            parallelism,
        } => {
            let argon2_params = Params::new(mem_cost_kib, time_cost, parallelism, Some(KEY_SIZE))
                .map_err(|e| CapsuleError::Crypto(format!("invalid Argon2id params: {e}")))?;

            Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
                .hash_password_into(passphrase.expose_secret().as_bytes(), app_salt, &mut key)
                .map_err(|e| CapsuleError::Crypto(format!("Argon2id KDF failed: {e}")))?;
        }
    }

    Ok(RoomKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &[u8] = b"capsule:v1";

    fn fast_argon2() -> KdfParams {
        KdfParams::Argon2id {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_kdf_deterministic() {
        let passphrase = SecretString::from("unit-test-pass");
        let params = KdfParams::default();

        let key1 = derive_room_key(&passphrase, SALT, &params).unwrap();
        let key2 = derive_room_key(&passphrase, SALT, &params).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
        assert_eq!(key1.as_bytes().len(), 32);
    }

    #[test]
    fn test_kdf_different_passphrases() {
        let params = KdfParams::default();

        let key1 = derive_room_key(&SecretString::from("passphrase-a"), SALT, &params).unwrap();
        let key2 = derive_room_key(&SecretString::from("passphrase-b"), SALT, &params).unwrap();

        assert_ne!(
            key1.as_bytes(),
            key2.as_bytes(),
            "different passphrases must produce different keys"
        );
    }

    #[test]
    fn test_kdf_different_app_salts() {
        let passphrase = SecretString::from("same-passphrase");
        let params = KdfParams::default();

        let key1 = derive_room_key(&passphrase, b"capsule:v1", &params).unwrap();
        let key2 = derive_room_key(&passphrase, b"capsule:v2", &params).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_rejects_low_iteration_count() {
        let passphrase = SecretString::from("pw");
        let params = KdfParams::Pbkdf2Sha256 { iterations: 1000 };

        let err = derive_room_key(&passphrase, SALT, &params).unwrap_err();
        assert!(matches!(err, CapsuleError::Crypto(_)));
    }

    #[test]
    fn test_argon2_deterministic_and_distinct_from_pbkdf2() {
        let passphrase = SecretString::from("unit-test-pass");

        let a1 = derive_room_key(&passphrase, SALT, &fast_argon2()).unwrap();
        let a2 = derive_room_key(&passphrase, SALT, &fast_argon2()).unwrap();
        let p = derive_room_key(&passphrase, SALT, &KdfParams::default()).unwrap();

        assert_eq!(a1, a2);
        assert_ne!(a1, p, "algorithm choice must change the room key");
    }

    #[test]
    fn test_params_from_config() {
        let mut cfg = CryptoConfig::default();
        assert_eq!(
            KdfParams::from(&cfg),
            KdfParams::Pbkdf2Sha256 { iterations: 200_000 }
        );

        cfg.kdf = KdfAlgorithm::Argon2id;
        assert!(matches!(KdfParams::from(&cfg), KdfParams::Argon2id { .. }));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = RoomKey::from_bytes([7u8; KEY_SIZE]);
        let printed = format!("{key:?}");
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains('7'));
    }
}
