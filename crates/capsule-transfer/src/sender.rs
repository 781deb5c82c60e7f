//! Outbound side of the transfer channel

use capsule_core::config::TransferConfig;
use capsule_core::{CapsuleError, CapsuleResult, ItemId, OutgoingFile, ProgressFn};
use capsule_crypto::{encrypt, item_id_now, SecretManager};
use capsule_signal::{ChannelMessage, DataChannel, ReadyState};
use serde_json::{Map, Value};
use tokio::io::AsyncRead;
use tracing::{debug, info, trace};

use crate::frame::{ChunkFrame, TextFrame};

/// Summary of one completed `send_file`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub item_id: ItemId,
    pub chunks: u64,
    pub bytes: u64,
}

/// Sends chat, location and encrypted files over an open data channel
pub struct TransferChannel<D> {
    channel: D,
    secrets: SecretManager,
    chunk_size: usize,
}

impl<D: DataChannel> TransferChannel<D> {
    pub fn new(channel: D, secrets: SecretManager, config: &TransferConfig) -> Self {
        Self {
            channel,
            secrets,
            chunk_size: config.chunk_size.max(1),
        }
    }

    pub fn channel(&self) -> &D {
        &self.channel
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn ensure_open(&self) -> CapsuleResult<()> {
        if self.channel.ready_state() != ReadyState::Open {
            return Err(CapsuleError::NotConnected);
        }
        Ok(())
    }

    async fn send_text(&self, frame: &TextFrame) -> CapsuleResult<()> {
        self.channel
            .send(ChannelMessage::Text(frame.encode()?))
            .await
    }

    /// Send a chat message. Chat text is not encrypted by this layer.
    pub async fn send_chat(&self, text: &str) -> CapsuleResult<()> {
        self.ensure_open()?;
        self.send_text(&TextFrame::Chat {
            text: text.to_string(),
        })
        .await?;
        debug!(len = text.len(), "chat sent");
        Ok(())
    }

    /// Send an opaque location payload. A `kind` field in `fields` is ignored.
    pub async fn send_location(&self, mut fields: Map<String, Value>) -> CapsuleResult<()> {
        self.ensure_open()?;
        fields.remove("kind");
        self.send_text(&TextFrame::Location(fields)).await
    }

    /// Announce and stream one file.
    ///
    /// One item key is derived per file and reused for every chunk; each
    /// chunk gets its own IV. The item salt rides in the `file-meta` frame.
    pub async fn send_file<R: AsyncRead + Unpin>(
        &self,
        mut file: OutgoingFile<R>,
        progress: Option<&ProgressFn>,
    ) -> CapsuleResult<SendReport> {
        self.ensure_open()?;
        let item_id = item_id_now(&file.name, file.size, &file.mime_type);
        let (key, salt) = self.secrets.derive_item_key(&item_id)?;

        self.send_text(&TextFrame::FileMeta {
            item_id: item_id.clone(),
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            size: file.size,
            chunk_size: self.chunk_size as u64,
            salt,
        })
        .await?;
        info!(item_id = %item_id, name = %file.name, size = file.size, "sending file");

        let mut index = 0u64;
        let mut sent = 0u64;
        if let Some(cb) = progress {
            cb(0, file.size, item_id.as_str());
        }

        while let Some(plain) = file.next_chunk(self.chunk_size).await? {
            let sealed = encrypt(&key, &plain)?;
            let frame = ChunkFrame::new(item_id.clone(), index, sealed.iv, sealed.ciphertext);
            self.channel
                .send(ChannelMessage::Binary(frame.encode()?))
                .await?;

            index += 1;
            sent += plain.len() as u64;
            trace!(item_id = %item_id, index, sent, "chunk sent");
            if let Some(cb) = progress {
                cb(sent, file.size, item_id.as_str());
            }
        }

        if sent != file.size {
            return Err(CapsuleError::InvalidState(format!(
                "{}: read {sent} bytes but declared {}",
                file.name, file.size
            )));
        }

        info!(item_id = %item_id, chunks = index, bytes = sent, "file sent");
        Ok(SendReport {
            item_id,
            chunks: index,
            bytes: sent,
        })
    }
}
