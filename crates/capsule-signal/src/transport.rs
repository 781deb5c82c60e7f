//! Seam to the host real-time communication stack
//!
//! Candidate gathering, DTLS and the SCTP data channel belong to the host.
//! These traits cover only what the signaling session and the transfer
//! channel need from it.

use std::future::Future;

use bytes::Bytes;
use capsule_core::config::IceServer;
use capsule_core::CapsuleResult;

use crate::blob::SessionDescription;

/// One message on the data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

/// Connection state as reported by the host transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Bidirectional message channel; clones are handles to the same channel.
///
/// The host guarantees reliable, in-order delivery of messages.
pub trait DataChannel: Clone + Send + Sync + 'static {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ReadyState;

    /// Queue a message. Fails with `NotConnected` unless the channel is open.
    fn send(&self, msg: ChannelMessage) -> impl Future<Output = CapsuleResult<()>> + Send;

    /// Next inbound message, or `None` once the channel is closed.
    fn recv(&self) -> impl Future<Output = Option<ChannelMessage>> + Send;

    fn close(&self);
}

/// A single peer connection object of the host stack
pub trait PeerConnection: Send + Sync + 'static {
    type Channel: DataChannel;

    /// Open a local data channel endpoint (offerer side).
    fn create_data_channel(&self, label: &str) -> CapsuleResult<Self::Channel>;

    fn create_offer(&self) -> impl Future<Output = CapsuleResult<SessionDescription>> + Send;

    fn create_answer(&self) -> impl Future<Output = CapsuleResult<SessionDescription>> + Send;

    fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> impl Future<Output = CapsuleResult<()>> + Send;

    fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> impl Future<Output = CapsuleResult<()>> + Send;

    /// Local description including every candidate gathered so far.
    fn local_description(&self) -> Option<SessionDescription>;

    fn gathering_state(&self) -> GatheringState;

    /// Resolves once candidate gathering reports completion.
    fn gathering_complete(&self) -> impl Future<Output = ()> + Send;

    /// Next channel opened by the remote side (answerer side).
    fn next_incoming_channel(&self) -> impl Future<Output = Option<Self::Channel>> + Send;

    fn connection_state(&self) -> PeerState;

    fn close(&self);
}

/// Factory for peer connections
pub trait Connector: Send + Sync {
    type Peer: PeerConnection;

    fn connect(&self, ice_servers: &[IceServer]) -> CapsuleResult<Self::Peer>;
}
