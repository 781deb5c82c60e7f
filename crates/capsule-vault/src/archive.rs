//! Vault export archive
//!
//! ```text
//! [8 bytes: "CPSVAULT"][u16 BE: version][u32 BE: header length]
//! [header JSON: {"version":1,"items":[VaultItem…]}]
//! [chunk units, items in header order, chunks by index]
//! ```
//! Units are not length-prefixed; each chunk's `len` in the header is what
//! splits the body back apart. Units stay encrypted, so exporting needs no
//! room key.

use bytes::Bytes;
use capsule_core::{CapsuleError, CapsuleResult, ItemId};
use capsule_crypto::{open_unit, SecretManager};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::record::VaultItem;
use crate::store::VaultStore;

pub const ARCHIVE_MAGIC: &[u8; 8] = b"CPSVAULT";
pub const ARCHIVE_VERSION: u16 = 1;

const PREAMBLE_LEN: usize = ARCHIVE_MAGIC.len() + 2 + 4;

#[derive(Debug, Deserialize)]
struct ArchiveHeader {
    version: u16,
    items: Vec<VaultItem>,
}

#[derive(Serialize)]
struct ArchiveHeaderRef<'a> {
    version: u16,
    items: &'a [VaultItem],
}

/// What an export wrote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub items: usize,
    pub chunks: usize,
    pub bytes: u64,
}

/// Write every item of `store` to `out`.
pub async fn export_archive<W: AsyncWrite + Unpin>(
    store: &VaultStore,
    out: &mut W,
) -> CapsuleResult<ExportSummary> {
    let mut items = store.list().await?;
    for item in &mut items {
        item.chunks.sort_by_key(|c| c.index);
    }

    let header = serde_json::to_vec(&ArchiveHeaderRef {
        version: ARCHIVE_VERSION,
        items: &items,
    })
    .map_err(|e| CapsuleError::Storage(format!("serializing archive header: {e}")))?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| CapsuleError::Storage("archive header exceeds 4 GiB".into()))?;

    out.write_all(ARCHIVE_MAGIC).await?;
    out.write_all(&ARCHIVE_VERSION.to_be_bytes()).await?;
    out.write_all(&header_len.to_be_bytes()).await?;
    out.write_all(&header).await?;
    let mut bytes = (PREAMBLE_LEN + header.len()) as u64;

    let mut chunks = 0;
    for item in &items {
        for chunk in &item.chunks {
            let unit = store.read_unit(chunk).await?;
            out.write_all(&unit).await?;
            bytes += unit.len() as u64;
            chunks += 1;
        }
        debug!(item_id = %item.id, chunks = item.chunks.len(), "item exported");
    }
    out.flush().await?;

    info!(items = items.len(), chunks, bytes, "vault exported");
    Ok(ExportSummary {
        items: items.len(),
        chunks,
        bytes,
    })
}

/// Export into memory.
pub async fn export_archive_bytes(store: &VaultStore) -> CapsuleResult<Vec<u8>> {
    let mut out = Vec::new();
    export_archive(store, &mut out).await?;
    Ok(out)
}

/// One item and its still-encrypted chunk units
#[derive(Debug, Clone)]
pub struct ArchivedItem {
    pub item: VaultItem,
    pub units: Vec<Bytes>,
}

impl ArchivedItem {
    /// Decrypt with the room key held by `secrets`.
    pub fn decrypt(&self, secrets: &SecretManager) -> CapsuleResult<Vec<u8>> {
        let key = secrets.item_key_from_salt(&self.item.id, &self.item.salt)?;
        let mut out = Vec::with_capacity(self.item.plaintext_capacity());
        for (chunk, unit) in self.item.chunks.iter().zip(&self.units) {
            out.extend_from_slice(&open_unit(&key, &self.item.id, chunk.index, unit)?);
        }
        self.item.check_decrypted_len(out.len())?;
        Ok(out)
    }
}

/// A parsed export archive
#[derive(Debug, Clone)]
pub struct Archive {
    pub version: u16,
    pub items: Vec<ArchivedItem>,
}

impl Archive {
    pub fn find(&self, id: &ItemId) -> Option<&ArchivedItem> {
        self.items.iter().find(|a| &a.item.id == id)
    }
}

fn malformed(msg: impl Into<String>) -> CapsuleError {
    CapsuleError::MalformedFrame(format!("archive: {}", msg.into()))
}

/// Parse an archive produced by [`export_archive`].
pub fn read_archive(data: Bytes) -> CapsuleResult<Archive> {
    if data.len() < PREAMBLE_LEN {
        return Err(malformed("truncated preamble"));
    }
    if &data[..ARCHIVE_MAGIC.len()] != ARCHIVE_MAGIC {
        return Err(malformed("bad magic"));
    }
    let version = u16::from_be_bytes([data[8], data[9]]);
    if version != ARCHIVE_VERSION {
        return Err(malformed(format!("unsupported version {version}")));
    }
    let header_len = u32::from_be_bytes([data[10], data[11], data[12], data[13]]) as usize;

    let body_start = PREAMBLE_LEN
        .checked_add(header_len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| malformed("truncated header"))?;
    let header: ArchiveHeader = serde_json::from_slice(&data[PREAMBLE_LEN..body_start])
        .map_err(|e| malformed(format!("header JSON: {e}")))?;
    if header.version != version {
        return Err(malformed("header version disagrees with preamble"));
    }

    let mut offset = body_start;
    let mut items = Vec::with_capacity(header.items.len());
    for item in header.items {
        let mut units = Vec::with_capacity(item.chunks.len());
        for chunk in &item.chunks {
            let end = usize::try_from(chunk.len)
                .ok()
                .and_then(|len| offset.checked_add(len))
                .filter(|&end| end <= data.len())
                .ok_or_else(|| malformed(format!("truncated body in {}", chunk.path)))?;
            units.push(data.slice(offset..end));
            offset = end;
        }
        items.push(ArchivedItem { item, units });
    }
    if offset != data.len() {
        return Err(malformed(format!(
            "{} trailing bytes after last chunk",
            data.len() - offset
        )));
    }

    Ok(Archive { version, items })
}
