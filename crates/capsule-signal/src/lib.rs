//! capsule-signal: serverless connection setup for a single peer link
//!
//! Session descriptions are exchanged out of band (copy/paste or QR) as
//! opaque base64 blobs. The real-time transport itself (ICE, DTLS, SCTP) is
//! supplied by the host platform and consumed through the traits in
//! [`transport`]; [`loopback`] is an in-process implementation of them.
//!
//! ```text
//! new → gathering → have-local-description → (blob exchanged) → connected | failed | closed
//! ```

pub mod blob;
pub mod loopback;
pub mod session;
pub mod transport;

pub use blob::{Role, SdpType, SessionDescription, SignalingBlob};
pub use session::{ChannelOf, ConnectionState, SignalingSession};
pub use transport::{
    ChannelMessage, Connector, DataChannel, GatheringState, PeerConnection, PeerState, ReadyState,
};
