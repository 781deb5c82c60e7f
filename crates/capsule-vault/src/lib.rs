//! capsule-vault: local encrypted-at-rest store, independent of any connection
//!
//! Files are split into fixed-size chunks, each sealed with AES-256-GCM
//! under the item key and written as its own storage unit. A plaintext JSON
//! record per item lists the chunks, the item salt and the file's name,
//! type, size and creation time. The storage root is any OpenDAL operator
//! (local filesystem or in-memory).

pub mod archive;
pub mod operator;
pub mod record;
pub mod store;

pub use archive::{
    export_archive, export_archive_bytes, read_archive, Archive, ArchivedItem, ExportSummary,
    ARCHIVE_MAGIC, ARCHIVE_VERSION,
};
pub use operator::{build_operator, fs_operator, memory_operator};
pub use record::{ChunkRef, VaultItem};
pub use store::VaultStore;
