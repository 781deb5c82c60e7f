//! capsule-crypto: passphrase-derived key hierarchy for capsule
//!
//! Key hierarchy:
//! ```text
//! Room Key (256-bit, PBKDF2-HMAC-SHA256 or Argon2id from passphrase, fixed public salt)
//!   └── Item Key (per file, HKDF-SHA256: salt=32 random bytes, info="item:"||item_id)
//!       └── Chunk AEAD: AES-256-GCM (key=item_key, iv=random 96-bit, fresh per chunk)
//! ```
//!
//! The item salt is not secret. It travels with the ciphertext (in the
//! `file-meta` frame, or the vault metadata record) so the other peer, or the
//! vault later, can re-derive the same item key.

pub mod chunk;
pub mod ids;
pub mod kdf;
pub mod keys;
pub mod passphrase;
pub mod secret;

pub use chunk::{decrypt, encrypt, open_unit, seal_unit, Sealed};
pub use ids::{item_id_for, item_id_now};
pub use kdf::{derive_room_key, KdfParams, RoomKey};
pub use keys::{derive_item_key, rederive_item_key, ItemKey, ItemSalt};
pub use passphrase::generate_passphrase;
pub use secret::SecretManager;

/// Size of a room or item key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM initialization vector (96-bit)
pub const IV_SIZE: usize = 12;

/// Size of the random HKDF salt bound to each item
pub const SALT_SIZE: usize = 32;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;
