//! Inbound side: frame dispatch and the single-item receive state machine
//!
//! ```text
//! Idle --file-meta--> Receiving(item) --last chunk--> Idle (FileCompleted)
//!                          |
//!                          +--file-meta / gap / auth failure / overflow / close--> FileAbandoned
//! ```
//!
//! Only one item is in flight. Chunk ordering comes from the channel's
//! reliable, in-order delivery; a gap in `sequenceIndex` means that
//! guarantee was broken and the item is abandoned rather than reassembled.

use std::fmt;

use capsule_core::{CapsuleError, ItemId};
use capsule_crypto::{decrypt, ItemKey, ItemSalt, SecretManager};
use capsule_signal::{ChannelMessage, DataChannel};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::frame::{ChunkFrame, TextFrame};

/// Upper bound on the up-front buffer reservation for a declared size
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;

/// A fully received and authenticated file
#[derive(Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub item_id: ItemId,
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl fmt::Debug for ReceivedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedFile")
            .field("item_id", &self.item_id)
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Why an in-flight item was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    /// A newer `file-meta` replaced it.
    Superseded { by: ItemId },
    /// Chunk arrived out of sequence.
    SequenceGap { expected: u64, got: u64 },
    AuthenticationFailed,
    /// More bytes arrived than the declared size.
    Overflow { declared: u64, received: u64 },
    /// No room key set when the item was announced.
    SecretRequired,
    /// Item key could not be derived.
    KeyDerivation(String),
    ChannelClosed,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::Superseded { by } => write!(f, "superseded by {by}"),
            AbandonReason::SequenceGap { expected, got } => {
                write!(f, "expected chunk {expected}, got {got}")
            }
            AbandonReason::AuthenticationFailed => f.write_str("authentication failed"),
            AbandonReason::Overflow { declared, received } => {
                write!(f, "received {received} bytes, declared {declared}")
            }
            AbandonReason::SecretRequired => f.write_str("room key not set"),
            AbandonReason::KeyDerivation(e) => write!(f, "item key derivation failed: {e}"),
            AbandonReason::ChannelClosed => f.write_str("channel closed"),
        }
    }
}

/// Everything the receive path reports to its consumer
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Chat(String),
    Location(Map<String, Value>),
    FileStarted {
        item_id: ItemId,
        name: String,
        mime_type: String,
        size: u64,
    },
    Progress {
        item_id: ItemId,
        received: u64,
        total: u64,
    },
    FileCompleted(ReceivedFile),
    FileAbandoned {
        item_id: ItemId,
        reason: AbandonReason,
    },
    /// Text frame of a kind this side does not handle.
    Unrecognized(String),
}

/// In-flight item: key, expected size and the plaintext so far
pub struct ReceiveContext {
    item_id: ItemId,
    name: String,
    mime_type: String,
    size: u64,
    key: ItemKey,
    next_index: u64,
    buffer: Vec<u8>,
}

impl ReceiveContext {
    pub fn item_id(&self) -> &ItemId {
        &self.item_id
    }

    pub fn received(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn finish(self) -> ReceivedFile {
        ReceivedFile {
            item_id: self.item_id,
            name: self.name,
            mime_type: self.mime_type,
            data: self.buffer,
        }
    }
}

#[derive(Default)]
pub enum ReceiveState {
    #[default]
    Idle,
    Receiving(Box<ReceiveContext>),
}

impl fmt::Debug for ReceiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiveState::Idle => f.write_str("Idle"),
            ReceiveState::Receiving(ctx) => f
                .debug_struct("Receiving")
                .field("item_id", &ctx.item_id)
                .field("received", &ctx.buffer.len())
                .field("size", &ctx.size)
                .finish(),
        }
    }
}

/// Turns channel messages into [`InboundEvent`]s
pub struct Receiver {
    secrets: SecretManager,
    state: ReceiveState,
}

impl Receiver {
    pub fn new(secrets: SecretManager) -> Self {
        Self {
            secrets,
            state: ReceiveState::Idle,
        }
    }

    pub fn state(&self) -> &ReceiveState {
        &self.state
    }

    /// Item currently being received, if any.
    pub fn active_item(&self) -> Option<&ItemId> {
        match &self.state {
            ReceiveState::Idle => None,
            ReceiveState::Receiving(ctx) => Some(&ctx.item_id),
        }
    }

    /// Process one message. Malformed and stray frames produce no events.
    pub fn handle(&mut self, msg: ChannelMessage) -> Vec<InboundEvent> {
        let mut events = Vec::new();
        match msg {
            ChannelMessage::Text(text) => self.on_text(text, &mut events),
            ChannelMessage::Binary(bytes) => match ChunkFrame::decode(&bytes) {
                Ok(frame) => self.on_chunk(frame, &mut events),
                Err(e) => warn!(error = %e, len = bytes.len(), "dropping binary frame"),
            },
        }
        events
    }

    /// The channel is gone; abandon whatever was in flight.
    pub fn close(&mut self) -> Option<InboundEvent> {
        self.abandon(AbandonReason::ChannelClosed)
    }

    fn on_text(&mut self, text: String, events: &mut Vec<InboundEvent>) {
        match TextFrame::decode(&text) {
            Ok(Some(TextFrame::Chat { text })) => events.push(InboundEvent::Chat(text)),
            Ok(Some(TextFrame::Location(fields))) => events.push(InboundEvent::Location(fields)),
            Ok(Some(TextFrame::FileMeta {
                item_id,
                name,
                mime_type,
                size,
                salt,
                ..
            })) => self.on_meta(item_id, name, mime_type, size, &salt, events),
            Ok(None) => {
                debug!("unrecognized text frame");
                events.push(InboundEvent::Unrecognized(text));
            }
            Err(e) => warn!(error = %e, "dropping text frame"),
        }
    }

    fn on_meta(
        &mut self,
        item_id: ItemId,
        name: String,
        mime_type: String,
        size: u64,
        salt: &ItemSalt,
        events: &mut Vec<InboundEvent>,
    ) {
        events.extend(self.abandon(AbandonReason::Superseded { by: item_id.clone() }));

        let key = match self.secrets.item_key_from_salt(&item_id, salt) {
            Ok(key) => key,
            Err(e) => {
                let reason = match e {
                    CapsuleError::SecretRequired => AbandonReason::SecretRequired,
                    other => AbandonReason::KeyDerivation(other.to_string()),
                };
                warn!(item_id = %item_id, %reason, "cannot receive item");
                events.push(InboundEvent::FileAbandoned { item_id, reason });
                return;
            }
        };

        info!(item_id = %item_id, name = %name, size, "receiving file");
        events.push(InboundEvent::FileStarted {
            item_id: item_id.clone(),
            name: name.clone(),
            mime_type: mime_type.clone(),
            size,
        });

        let ctx = ReceiveContext {
            item_id,
            name,
            mime_type,
            size,
            key,
            next_index: 0,
            buffer: Vec::with_capacity(size.min(MAX_PREALLOC) as usize),
        };
        if size == 0 {
            info!(item_id = %ctx.item_id, "empty file completed");
            events.push(InboundEvent::FileCompleted(ctx.finish()));
        } else {
            self.state = ReceiveState::Receiving(Box::new(ctx));
        }
    }

    fn on_chunk(&mut self, frame: ChunkFrame, events: &mut Vec<InboundEvent>) {
        let header = &frame.header;
        let ReceiveState::Receiving(ctx) = &mut self.state else {
            warn!(item_id = %header.item_id, index = header.sequence_index, "chunk with no active item, dropped");
            return;
        };
        if header.item_id != ctx.item_id {
            warn!(
                item_id = %header.item_id,
                active = %ctx.item_id,
                index = header.sequence_index,
                "chunk for inactive item, dropped"
            );
            return;
        }

        if header.sequence_index != ctx.next_index {
            let reason = AbandonReason::SequenceGap {
                expected: ctx.next_index,
                got: header.sequence_index,
            };
            events.extend(self.abandon(reason));
            return;
        }

        let plain = match decrypt(&ctx.key, &header.iv, &frame.ciphertext) {
            Ok(plain) => plain,
            Err(_) => {
                events.extend(self.abandon(AbandonReason::AuthenticationFailed));
                return;
            }
        };

        let received = ctx.buffer.len() as u64 + plain.len() as u64;
        if received > ctx.size {
            let reason = AbandonReason::Overflow {
                declared: ctx.size,
                received,
            };
            events.extend(self.abandon(reason));
            return;
        }

        ctx.buffer.extend_from_slice(&plain);
        ctx.next_index += 1;
        trace!(item_id = %ctx.item_id, index = header.sequence_index, received, "chunk received");
        events.push(InboundEvent::Progress {
            item_id: ctx.item_id.clone(),
            received,
            total: ctx.size,
        });

        if received == ctx.size {
            if let ReceiveState::Receiving(ctx) = std::mem::take(&mut self.state) {
                info!(item_id = %ctx.item_id, chunks = ctx.next_index, bytes = received, "file received");
                events.push(InboundEvent::FileCompleted(ctx.finish()));
            }
        }
    }

    /// Drop the in-flight item, if any, and report why.
    fn abandon(&mut self, reason: AbandonReason) -> Option<InboundEvent> {
        match std::mem::take(&mut self.state) {
            ReceiveState::Idle => None,
            ReceiveState::Receiving(ctx) => {
                warn!(
                    item_id = %ctx.item_id,
                    received = ctx.buffer.len(),
                    size = ctx.size,
                    %reason,
                    "file abandoned"
                );
                Some(InboundEvent::FileAbandoned {
                    item_id: ctx.item_id,
                    reason,
                })
            }
        }
    }
}

/// Read frames until the channel closes, forwarding events.
///
/// Stops early when the event consumer goes away.
pub async fn run_receive_loop<D: DataChannel>(
    channel: D,
    mut receiver: Receiver,
    events: mpsc::Sender<InboundEvent>,
) {
    debug!(label = channel.label(), "receive loop started");
    while let Some(msg) = channel.recv().await {
        for event in receiver.handle(msg) {
            if events.send(event).await.is_err() {
                debug!("event consumer gone, receive loop stopping");
                return;
            }
        }
    }
    if let Some(event) = receiver.close() {
        let _ = events.send(event).await;
    }
    debug!("receive loop finished: channel closed");
}
