//! Per-item metadata record (`items/<id>.json`)

use capsule_core::{CapsuleError, CapsuleResult, ItemId};
use capsule_crypto::ItemSalt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Location and size of one stored chunk unit (`iv || ciphertext`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub index: u64,
    pub path: String,
    /// Unit length in bytes: 12-byte IV plus ciphertext and tag.
    pub len: u64,
}

/// Metadata for one stored item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultItem {
    pub id: ItemId,
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    #[serde(with = "iso_millis")]
    pub created_at: DateTime<Utc>,
    pub salt: ItemSalt,
    pub chunks: Vec<ChunkRef>,
}

impl VaultItem {
    pub fn from_bytes(data: &[u8]) -> CapsuleResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| CapsuleError::Storage(format!("parsing item record: {e}")))
    }

    pub fn to_bytes(&self) -> CapsuleResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| CapsuleError::Storage(format!("serializing item record {}: {e}", self.id)))
    }

    /// Total bytes of all chunk units.
    pub fn stored_len(&self) -> u64 {
        self.chunks.iter().fold(0u64, |acc, c| acc.saturating_add(c.len))
    }

    /// Buffer reservation for decrypting this item. `size` comes from disk
    /// or an archive header, so it only hints.
    pub(crate) fn plaintext_capacity(&self) -> usize {
        self.size.min(MAX_PREALLOC) as usize
    }

    /// Fails unless `decrypted` bytes match the recorded size.
    pub(crate) fn check_decrypted_len(&self, decrypted: usize) -> CapsuleResult<()> {
        if decrypted as u64 != self.size {
            return Err(CapsuleError::Storage(format!(
                "{}: decrypted {decrypted} bytes, record says {}",
                self.id, self.size
            )));
        }
        Ok(())
    }

    /// `createdAt` as written in the record.
    pub fn created_at_string(&self) -> String {
        iso_millis::format(&self.created_at)
    }
}

/// Key of the metadata record for `id`
pub fn item_path(id: &ItemId) -> String {
    format!("{ITEMS_DIR}{id}.json")
}

/// Key of chunk `index` of `id`
pub fn chunk_path(id: &ItemId, index: u64) -> String {
    format!("{CHUNKS_DIR}{}/{id}-{index}.chunk", id.shard())
}

pub const ITEMS_DIR: &str = "items/";
/// Upper bound on the up-front buffer reservation when decrypting
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;
pub const CHUNKS_DIR: &str = "chunks/";

/// Fixed-width UTC timestamps: `2025-01-31T09:15:02.123Z`.
///
/// Lexicographic order of these strings is chronological order.
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
