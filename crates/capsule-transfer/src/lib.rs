//! capsule-transfer: chat and encrypted file transfer over one data channel
//!
//! The sender streams each file as a `file-meta` text frame followed by
//! AES-256-GCM encrypted `file-chunk` binary frames under a single item key.
//! The receiver re-derives that key from the room key plus the salt carried
//! in `file-meta`, and reassembles exactly one item at a time.
//!
//! Chat and location frames are plain JSON; only file content is encrypted
//! at this layer.

pub mod frame;
pub mod receiver;
pub mod sender;

pub use frame::{ChunkFrame, ChunkHeader, TextFrame};
pub use receiver::{
    run_receive_loop, AbandonReason, InboundEvent, ReceiveState, ReceivedFile, Receiver,
};
pub use sender::{SendReport, TransferChannel};
