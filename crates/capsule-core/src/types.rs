use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Progress callback type (bytes_done, bytes_total, item_id)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

/// MIME type used when the source does not say what it is
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Identifier of a transferred or stored item (`itm_` + 12 hex chars).
///
/// Practically unique, not adversarially unique: it is a truncated hash of
/// name, size, type and a timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub const PREFIX: &'static str = "itm_";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character shard used to fan out chunk storage directories.
    ///
    /// Skips the fixed `itm_` prefix so items actually spread across shards.
    pub fn shard(&self) -> &str {
        let body = self.0.strip_prefix(Self::PREFIX).unwrap_or(&self.0);
        match body.char_indices().nth(2) {
            Some((end, _)) => &body[..end],
            None => body,
        }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A file about to be sent over the channel or imported into the vault.
///
/// Content is streamed from `reader` in fixed-size chunks; `size` is the
/// declared total and is what the receiving side waits for.
pub struct OutgoingFile<R> {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub reader: R,
}

impl<R> fmt::Debug for OutgoingFile<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish()
    }
}

impl OutgoingFile<Cursor<Vec<u8>>> {
    /// Wrap an in-memory buffer.
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size: data.len() as u64,
            reader: Cursor::new(data),
        }
    }
}

impl OutgoingFile<tokio::fs::File> {
    /// Open a local file. The MIME type defaults to `application/octet-stream`.
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        Ok(Self {
            name,
            mime_type: DEFAULT_MIME_TYPE.to_string(),
            size,
            reader: file,
        })
    }
}

impl<R: AsyncRead + Unpin> OutgoingFile<R> {
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Read the next chunk of at most `chunk_size` bytes.
    ///
    /// Keeps reading until the chunk is full or the reader is exhausted, so
    /// every chunk except the last is exactly `chunk_size` long. Returns
    /// `None` once the reader has nothing left.
    pub async fn next_chunk(&mut self, chunk_size: usize) -> std::io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; chunk_size];
        let mut filled = 0;
        while filled < chunk_size {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(buf))
    }
}
