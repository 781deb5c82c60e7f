//! SecretManager: explicit holder of the room key
//!
//! A cloneable handle shared by the signaling session, the transfer channel
//! and the vault. Only `derive`, `set_key` and `clear` mutate it; everything
//! else reads.

use std::sync::{Arc, PoisonError, RwLock};

use capsule_core::config::CryptoConfig;
use capsule_core::{CapsuleError, CapsuleResult, ItemId};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::kdf::{derive_room_key, KdfParams, RoomKey};
use crate::keys::{derive_item_key, rederive_item_key, ItemKey, ItemSalt};

/// Shared room-key slot plus the KDF settings used to fill it
#[derive(Clone)]
pub struct SecretManager {
    params: KdfParams,
    app_salt: Arc<[u8]>,
    slot: Arc<RwLock<Option<RoomKey>>>,
}

impl Default for SecretManager {
    fn default() -> Self {
        Self::new(KdfParams::default(), b"capsule:v1".to_vec())
    }
}

impl std::fmt::Debug for SecretManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretManager")
            .field("params", &self.params)
            .field("has_key", &self.has_key())
            .finish()
    }
}

impl SecretManager {
    pub fn new(params: KdfParams, app_salt: impl Into<Vec<u8>>) -> Self {
        Self {
            params,
            app_salt: Arc::from(app_salt.into()),
            slot: Arc::new(RwLock::new(None)),
        }
    }

    pub fn from_config(cfg: &CryptoConfig) -> CapsuleResult<Self> {
        cfg.validate()?;
        Ok(Self::new(KdfParams::from(cfg), cfg.app_salt.as_bytes().to_vec()))
    }

    /// Derive the room key from `passphrase` and make it current.
    ///
    /// An empty passphrase clears the key and returns `None`. The KDF runs on
    /// a blocking worker so the async caller is not stalled.
    pub async fn derive(&self, passphrase: &SecretString) -> CapsuleResult<Option<RoomKey>> {
        if passphrase.expose_secret().is_empty() {
            self.clear();
            return Ok(None);
        }

        let passphrase = passphrase.clone();
        let params = self.params.clone();
        let salt = Arc::clone(&self.app_salt);
        let key = tokio::task::spawn_blocking(move || derive_room_key(&passphrase, &salt, &params))
            .await
            .map_err(|e| CapsuleError::Crypto(format!("KDF task failed: {e}")))??;

        self.set_key(key.clone());
        info!("room key derived");
        Ok(Some(key))
    }

    /// Install an already-derived room key.
    pub fn set_key(&self, key: RoomKey) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(key);
    }

    /// Forget the room key. Later item-key requests fail with `SecretRequired`.
    pub fn clear(&self) {
        let previous = self
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            debug!("room key cleared");
        }
    }

    /// Current room key, if any. Performs no derivation.
    pub fn current_key(&self) -> Option<RoomKey> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_key(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Current room key, or `SecretRequired`.
    pub fn require_key(&self) -> CapsuleResult<RoomKey> {
        self.current_key().ok_or(CapsuleError::SecretRequired)
    }

    /// Derive a new item key with a fresh random salt.
    pub fn derive_item_key(&self, item_id: &ItemId) -> CapsuleResult<(ItemKey, ItemSalt)> {
        derive_item_key(&self.require_key()?, item_id)
    }

    /// Reproduce an item key from the salt that travelled with its ciphertext.
    pub fn item_key_from_salt(&self, item_id: &ItemId, salt: &ItemSalt) -> CapsuleResult<ItemKey> {
        rederive_item_key(&self.require_key()?, item_id, salt)
    }
}
