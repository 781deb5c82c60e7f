//! Item keys: room key + random salt + item id → per-item AES key

use capsule_core::{CapsuleError, CapsuleResult, ItemId};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::kdf::RoomKey;
use crate::{KEY_SIZE, SALT_SIZE};

/// The per-item HKDF salt. Public; stored or sent next to the ciphertext.
pub type ItemSalt = [u8; SALT_SIZE];

/// A per-item 256-bit encryption key. Never persisted. Zeroized on drop.
#[derive(Clone)]
pub struct ItemKey {
    bytes: [u8; KEY_SIZE],
}

impl ItemKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for ItemKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive a fresh item key under a newly generated random salt.
///
/// Returns the key and the salt; the salt must accompany the ciphertext so
/// [`rederive_item_key`] can reproduce the key for decryption.
pub fn derive_item_key(room: &RoomKey, item_id: &ItemId) -> CapsuleResult<(ItemKey, ItemSalt)> {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let key = rederive_item_key(room, item_id, &salt)?;
    Ok((key, salt))
}

/// Re-derive the item key for a known salt.
///
/// HKDF-SHA256, IKM = room key, salt = item salt, info = `"item:" || item_id`.
pub fn rederive_item_key(
    room: &RoomKey,
    item_id: &ItemId,
    salt: &ItemSalt,
) -> CapsuleResult<ItemKey> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), room.as_bytes());
    let info = format!("item:{item_id}");
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info.as_bytes(), &mut okm)
        .map_err(|e| CapsuleError::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(ItemKey::from_bytes(okm))
}
