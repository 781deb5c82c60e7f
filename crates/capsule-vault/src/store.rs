//! Encrypted chunk store and metadata index
//!
//! Layout under the operator root:
//! ```text
//! items/<itemId>.json                  metadata record
//! chunks/<shard>/<itemId>-<n>.chunk    [12-byte IV][ciphertext + tag]
//! ```
//! One item key per item, one fresh IV per chunk. The item salt is kept in
//! the record so the key can be re-derived from the room key later. Each
//! unit is bound to its item id and chunk index.

use capsule_core::{CapsuleError, CapsuleResult, ItemId, OutgoingFile, ProgressFn};
use capsule_crypto::{item_id_for, open_unit, seal_unit, SecretManager};
use chrono::{DateTime, TimeDelta, Utc};
use opendal::{ErrorKind, Operator};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::record::{chunk_path, item_path, ChunkRef, VaultItem, ITEMS_DIR};

const MAX_ID_ATTEMPTS: usize = 1024;

pub struct VaultStore {
    op: Operator,
    secrets: SecretManager,
    chunk_size: usize,
}

fn storage_err(context: String) -> impl FnOnce(opendal::Error) -> CapsuleError {
    move |e| CapsuleError::Storage(format!("{context}: {e}"))
}

/// Current time truncated to what the record keeps.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

impl VaultStore {
    pub fn new(op: Operator, secrets: SecretManager, chunk_size: usize) -> Self {
        Self {
            op,
            secrets,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Import files in order. Fails with `SecretRequired` before touching
    /// storage when no room key is set.
    pub async fn add<R: AsyncRead + Unpin>(
        &self,
        files: Vec<OutgoingFile<R>>,
        progress: Option<&ProgressFn>,
    ) -> CapsuleResult<Vec<VaultItem>> {
        self.secrets.require_key()?;
        let mut stored = Vec::with_capacity(files.len());
        for file in files {
            stored.push(self.add_one(file, progress).await?);
        }
        info!(count = stored.len(), "vault import complete");
        Ok(stored)
    }

    /// Encrypt and store a single file, then write its record.
    ///
    /// The record is written last; a failure part-way leaves orphan chunk
    /// units but no visible item.
    pub async fn add_one<R: AsyncRead + Unpin>(
        &self,
        mut file: OutgoingFile<R>,
        progress: Option<&ProgressFn>,
    ) -> CapsuleResult<VaultItem> {
        let (id, created_at) = self
            .unused_id(&file.name, file.size, &file.mime_type, now_millis())
            .await?;
        let (key, salt) = self.secrets.derive_item_key(&id)?;

        let mut chunks = Vec::new();
        let mut total = 0u64;
        while let Some(plain) = file.next_chunk(self.chunk_size).await? {
            let index = chunks.len() as u64;
            let unit = seal_unit(&key, &id, index, &plain)?;
            let path = chunk_path(&id, index);
            let len = unit.len() as u64;

            self.op
                .write(&path, unit)
                .await
                .map_err(storage_err(format!("writing chunk {index}: {path}")))?;
            chunks.push(ChunkRef { index, path, len });

            total += plain.len() as u64;
            if let Some(cb) = progress {
                cb(total, file.size, id.as_str());
            }
        }

        if total != file.size {
            warn!(item_id = %id, declared = file.size, read = total, "size changed while importing");
        }

        let item = VaultItem {
            id: id.clone(),
            name: file.name,
            mime_type: file.mime_type,
            size: total,
            created_at,
            salt,
            chunks,
        };
        let record_path = item_path(&id);
        self.op
            .write(&record_path, item.to_bytes()?)
            .await
            .map_err(storage_err(format!("writing record {record_path}")))?;

        info!(
            item_id = %id,
            name = %item.name,
            chunks = item.chunks.len(),
            bytes = total,
            "stored"
        );
        Ok(item)
    }

    /// Item id and creation time for a new item.
    ///
    /// Ids hash name, size, type and the millisecond timestamp, so two
    /// identical announcements in one millisecond collide. On a collision the
    /// timestamp is moved forward until the id is free.
    async fn unused_id(
        &self,
        name: &str,
        size: u64,
        mime_type: &str,
        mut created_at: DateTime<Utc>,
    ) -> CapsuleResult<(ItemId, DateTime<Utc>)> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = item_id_for(name, size, mime_type, created_at.timestamp_millis() as u64);
            let path = item_path(&id);
            let taken = self
                .op
                .exists(&path)
                .await
                .map_err(storage_err(format!("checking {path}")))?;
            if !taken {
                return Ok((id, created_at));
            }
            debug!(item_id = %id, "item id taken, advancing timestamp");
            created_at += TimeDelta::milliseconds(1);
        }
        Err(CapsuleError::Storage(format!(
            "no free item id for {name} after {MAX_ID_ATTEMPTS} attempts"
        )))
    }

    /// Every record, oldest first (ties broken by id).
    ///
    /// Records that fail to parse are skipped with a warning.
    pub async fn list(&self) -> CapsuleResult<Vec<VaultItem>> {
        let entries = match self.op.list(ITEMS_DIR).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err(format!("listing {ITEMS_DIR}"))(e)),
        };

        let mut items = Vec::new();
        for entry in entries {
            if !entry.metadata().is_file() || !entry.name().ends_with(".json") {
                continue;
            }
            let data = self
                .op
                .read(entry.path())
                .await
                .map_err(storage_err(format!("reading {}", entry.path())))?;
            match VaultItem::from_bytes(&data.to_vec()) {
                Ok(item) => items.push(item),
                Err(e) => warn!(path = entry.path(), error = %e, "skipping unreadable record"),
            }
        }

        items.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        debug!(count = items.len(), "listed vault items");
        Ok(items)
    }

    pub async fn get(&self, id: &ItemId) -> CapsuleResult<VaultItem> {
        let path = item_path(id);
        let data = self.op.read(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                CapsuleError::NotFound(id.to_string())
            } else {
                CapsuleError::Storage(format!("reading {path}: {e}"))
            }
        })?;
        VaultItem::from_bytes(&data.to_vec())
    }

    /// Raw stored unit for one chunk, checked against its recorded length.
    pub async fn read_unit(&self, chunk: &ChunkRef) -> CapsuleResult<Vec<u8>> {
        let unit = self
            .op
            .read(&chunk.path)
            .await
            .map_err(storage_err(format!("reading {}", chunk.path)))?
            .to_vec();
        if unit.len() as u64 != chunk.len {
            return Err(CapsuleError::Storage(format!(
                "{}: expected {} bytes, found {}",
                chunk.path,
                chunk.len,
                unit.len()
            )));
        }
        Ok(unit)
    }

    /// Decrypt an item back to its original bytes.
    ///
    /// Any chunk failing authentication fails the whole read; no partial
    /// plaintext is returned.
    pub async fn read_item(&self, id: &ItemId) -> CapsuleResult<Vec<u8>> {
        let item = self.get(id).await?;
        let key = self.secrets.item_key_from_salt(&item.id, &item.salt)?;

        let mut chunks = item.chunks.clone();
        chunks.sort_by_key(|c| c.index);

        let mut out = Vec::with_capacity(item.plaintext_capacity());
        for chunk in &chunks {
            let unit = self.read_unit(chunk).await?;
            out.extend_from_slice(&open_unit(&key, &item.id, chunk.index, &unit)?);
        }
        item.check_decrypted_len(out.len())?;
        debug!(item_id = %id, bytes = out.len(), "item decrypted");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::memory_operator;
    use capsule_crypto::RoomKey;

    fn store(chunk_size: usize) -> VaultStore {
        let secrets = SecretManager::default();
        secrets.set_key(RoomKey::from_bytes([4u8; 32]));
        VaultStore::new(memory_operator().unwrap(), secrets, chunk_size)
    }

    #[tokio::test]
    async fn add_without_key_writes_nothing() {
        let store = VaultStore::new(memory_operator().unwrap(), SecretManager::default(), 4);
        let err = store
            .add(vec![OutgoingFile::from_bytes("a", "text/plain", vec![1, 2])], None)
            .await
            .unwrap_err();
        assert!(matches!(err, CapsuleError::SecretRequired));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunks_land_in_shard_directory() {
        let store = store(4);
        let item = store
            .add_one(OutgoingFile::from_bytes("a.txt", "text/plain", b"0123456789".to_vec()), None)
            .await
            .unwrap();

        assert_eq!(item.chunks.len(), 3);
        let shard = item.id.shard().to_string();
        for (i, chunk) in item.chunks.iter().enumerate() {
            assert_eq!(chunk.index, i as u64);
            assert_eq!(chunk.path, format!("chunks/{shard}/{}-{i}.chunk", item.id));
            assert!(store.op.exists(&chunk.path).await.unwrap());
        }
        // 12 IV + plaintext + 16 tag
        assert_eq!(item.chunks[0].len, 12 + 4 + 16);
        assert_eq!(item.chunks[2].len, 12 + 2 + 16);
    }

    #[tokio::test]
    async fn empty_file_has_no_chunks() {
        let store = store(4);
        let item = store
            .add_one(OutgoingFile::from_bytes("empty", "text/plain", Vec::new()), None)
            .await
            .unwrap();
        assert!(item.chunks.is_empty());
        assert_eq!(store.read_item(&item.id).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let store = store(4);
        assert!(matches!(
            store.get(&ItemId::new("itm_000000000000")).await,
            Err(CapsuleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn tampered_chunk_fails_authentication() {
        let store = store(4);
        let item = store
            .add_one(OutgoingFile::from_bytes("t", "text/plain", b"abcdefgh".to_vec()), None)
            .await
            .unwrap();

        let path = &item.chunks[1].path;
        let mut unit = store.op.read(path).await.unwrap().to_vec();
        let last = unit.len() - 1;
        unit[last] ^= 0x01;
        store.op.write(path, unit).await.unwrap();

        assert!(matches!(
            store.read_item(&item.id).await,
            Err(CapsuleError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn same_name_in_one_millisecond_keeps_both_items() {
        let store = store(4);
        let added = store
            .add(
                vec![
                    OutgoingFile::from_bytes("a.txt", "text/plain", b"0123456789".to_vec()),
                    OutgoingFile::from_bytes("a.txt", "text/plain", b"abcdefghij".to_vec()),
                ],
                None,
            )
            .await
            .unwrap();

        assert_ne!(added[0].id, added[1].id);
        assert_eq!(store.list().await.unwrap().len(), 2);
        assert_eq!(store.read_item(&added[0].id).await.unwrap(), b"0123456789");
        assert_eq!(store.read_item(&added[1].id).await.unwrap(), b"abcdefghij");
    }

    #[tokio::test]
    async fn taken_id_advances_created_at() {
        let store = store(4);
        let first = store
            .add_one(OutgoingFile::from_bytes("dup", "text/plain", vec![1]), None)
            .await
            .unwrap();
        // Occupy the ids for the next few milliseconds as well
        let base = first.created_at.timestamp_millis() as u64;
        for ms in base..base + 5 {
            let id = item_id_for("dup", 1, "text/plain", ms);
            store.op.write(&item_path(&id), first.to_bytes().unwrap()).await.unwrap();
        }

        let (id, created_at) = store
            .unused_id("dup", 1, "text/plain", first.created_at)
            .await
            .unwrap();
        assert_eq!(created_at.timestamp_millis() as u64, base + 5);
        assert_eq!(id, item_id_for("dup", 1, "text/plain", base + 5));
        assert!(!store.op.exists(&item_path(&id)).await.unwrap());
    }

    #[tokio::test]
    async fn oversized_record_fails_cleanly() {
        let store = store(4);
        let mut item = store
            .add_one(OutgoingFile::from_bytes("s", "text/plain", b"abc".to_vec()), None)
            .await
            .unwrap();
        item.size = u64::MAX;
        store.op.write(&item_path(&item.id), item.to_bytes().unwrap()).await.unwrap();

        assert!(matches!(
            store.read_item(&item.id).await,
            Err(CapsuleError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn swapped_chunks_fail_authentication() {
        let store = store(4);
        let item = store
            .add_one(OutgoingFile::from_bytes("s", "text/plain", b"AAAABBBB".to_vec()), None)
            .await
            .unwrap();

        let first = store.op.read(&item.chunks[0].path).await.unwrap().to_vec();
        let second = store.op.read(&item.chunks[1].path).await.unwrap().to_vec();
        store.op.write(&item.chunks[0].path, second).await.unwrap();
        store.op.write(&item.chunks[1].path, first).await.unwrap();

        assert!(matches!(
            store.read_item(&item.id).await,
            Err(CapsuleError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn list_skips_foreign_and_broken_records() {
        let store = store(4);
        store
            .add_one(OutgoingFile::from_bytes("ok", "text/plain", vec![1]), None)
            .await
            .unwrap();
        store.op.write("items/notes.txt", b"hi".to_vec()).await.unwrap();
        store.op.write("items/broken.json", b"{".to_vec()).await.unwrap();

        let items = store.list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "ok");
    }
}
