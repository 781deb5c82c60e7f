//! Per-chunk AES-256-GCM encryption/decryption
//!
//! Every call draws a fresh random 96-bit IV. Reusing an IV under the same
//! item key would break GCM confidentiality, so callers never supply one.
//!
//! Stored unit format (vault):
//! ```text
//! [12 bytes: IV][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//! On the wire the IV travels in the chunk header instead.
//!
//! Stored units bind `chunk_index || item_id` as associated data, so a unit
//! moved to another index or item fails authentication.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use capsule_core::{CapsuleError, CapsuleResult, ItemId};
use rand::RngCore;

use crate::keys::ItemKey;
use crate::{IV_SIZE, TAG_SIZE};

/// Output of [`encrypt`]: the IV and the ciphertext with its tag appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub iv: [u8; IV_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` under `key` with a fresh random IV.
pub fn encrypt(key: &ItemKey, plaintext: &[u8]) -> CapsuleResult<Sealed> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| CapsuleError::Crypto(format!("chunk encryption failed: {e}")))?;

    Ok(Sealed { iv, ciphertext })
}

/// Decrypt and authenticate `ciphertext`.
///
/// Any tag mismatch (wrong key, wrong IV, flipped bit) is
/// `AuthenticationFailed`; unverified bytes are never returned.
pub fn decrypt(key: &ItemKey, iv: &[u8; IV_SIZE], ciphertext: &[u8]) -> CapsuleResult<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CapsuleError::AuthenticationFailed);
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CapsuleError::AuthenticationFailed)
}

/// Encrypt chunk `chunk_index` of `item_id` into a single storage unit:
/// `iv || ciphertext`.
pub fn seal_unit(
    key: &ItemKey,
    item_id: &ItemId,
    chunk_index: u64,
    plaintext: &[u8],
) -> CapsuleResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let aad = build_aad(chunk_index, item_id);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| CapsuleError::Crypto(format!("unit encryption failed: {e}")))?;

    let mut unit = Vec::with_capacity(IV_SIZE + ciphertext.len());
    unit.extend_from_slice(&iv);
    unit.extend_from_slice(&ciphertext);
    Ok(unit)
}

/// Decrypt a storage unit produced by [`seal_unit`] for the same item and
/// index.
pub fn open_unit(
    key: &ItemKey,
    item_id: &ItemId,
    chunk_index: u64,
    unit: &[u8],
) -> CapsuleResult<Vec<u8>> {
    if unit.len() < IV_SIZE + TAG_SIZE {
        return Err(CapsuleError::AuthenticationFailed);
    }
    let (iv, ciphertext) = unit.split_at(IV_SIZE);

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let aad = build_aad(chunk_index, item_id);
    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CapsuleError::AuthenticationFailed)
}

fn build_aad(chunk_index: u64, item_id: &ItemId) -> Vec<u8> {
    let id = item_id.as_str().as_bytes();
    let mut aad = Vec::with_capacity(8 + id.len());
    aad.extend_from_slice(&chunk_index.to_be_bytes());
    aad.extend_from_slice(id);
    aad
}
