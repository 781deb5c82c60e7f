//! Item identifiers: truncated SHA-256 of name, size, type and send time

use capsule_core::ItemId;
use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// Hex characters of the digest kept in the id
const ID_HEX_LEN: usize = 12;

/// Compute the id for an item sent or stored at `timestamp_ms`.
///
/// `"itm_" + hex(SHA-256(name || size || mime_type || timestamp_ms))[..12]`,
/// with size and timestamp rendered as decimal text.
pub fn item_id_for(name: &str, size: u64, mime_type: &str, timestamp_ms: u64) -> ItemId {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(size.to_string().as_bytes());
    hasher.update(mime_type.as_bytes());
    hasher.update(timestamp_ms.to_string().as_bytes());
    let digest = hasher.finalize();

    let mut id = String::with_capacity(ItemId::PREFIX.len() + ID_HEX_LEN);
    id.push_str(ItemId::PREFIX);
    for byte in digest.iter().take(ID_HEX_LEN / 2) {
        let _ = write!(id, "{byte:02x}");
    }
    ItemId::new(id)
}

/// [`item_id_for`] stamped with the current wall-clock time.
pub fn item_id_now(name: &str, size: u64, mime_type: &str) -> ItemId {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    item_id_for(name, size, mime_type, now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_shape() {
        let id = item_id_for("a.txt", 10, "text/plain", 1_700_000_000_000);
        assert!(id.as_str().starts_with("itm_"));
        assert_eq!(id.as_str().len(), 4 + 12);
        assert!(id.as_str()[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn id_is_deterministic_for_same_inputs() {
        let a = item_id_for("a.txt", 10, "text/plain", 42);
        let b = item_id_for("a.txt", 10, "text/plain", 42);
        assert_eq!(a, b);
    }

    #[test]
    fn timestamp_changes_id() {
        let a = item_id_for("a.txt", 10, "text/plain", 42);
        let b = item_id_for("a.txt", 10, "text/plain", 43);
        assert_ne!(a, b);
    }
}
