//! In-process transport implementing the host traits over tokio channels
//!
//! Peers created from the same [`LoopbackNetwork`] find each other through
//! the session id embedded in their SDP `o=` line. Applying the answer on
//! the offerer side links the two peers: every channel the offerer opened
//! gets a counterpart delivered to the answerer as an incoming channel.
//!
//! Gathering "finds" one host candidate after a configurable delay, or
//! never, which is how the gathering timeout is exercised.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use capsule_core::config::IceServer;
use capsule_core::{CapsuleError, CapsuleResult};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::blob::{SdpType, SessionDescription};
use crate::transport::{
    ChannelMessage, Connector, DataChannel, GatheringState, PeerConnection, PeerState, ReadyState,
};

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared rendezvous for loopback peers
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    peers: Arc<Mutex<HashMap<String, Weak<PeerInner>>>>,
    next_session: Arc<AtomicU64>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, inner: &Arc<PeerInner>) {
        locked(&self.peers).insert(inner.session_id.clone(), Arc::downgrade(inner));
    }

    fn lookup(&self, session_id: &str) -> Option<Arc<PeerInner>> {
        locked(&self.peers).get(session_id).and_then(Weak::upgrade)
    }

    fn allocate_session_id(&self) -> String {
        // Mix in the wall clock so ids differ across networks too
        let n = self.next_session.fetch_add(1, Ordering::Relaxed);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        format!("{}{:09}", n + 1, nanos)
    }

    /// Simulate losing the network: every linked peer fails and its
    /// channels close.
    pub fn sever(&self) {
        let peers: Vec<Arc<PeerInner>> = locked(&self.peers)
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for peer in peers {
            peer.shut_down(PeerState::Failed);
        }
    }
}

/// Connector producing loopback peers
#[derive(Clone)]
pub struct LoopbackConnector {
    network: LoopbackNetwork,
    gather_delay: Option<Duration>,
}

impl LoopbackConnector {
    /// Gathering completes immediately.
    pub fn new(network: LoopbackNetwork) -> Self {
        Self {
            network,
            gather_delay: Some(Duration::ZERO),
        }
    }

    /// `None` means gathering never completes.
    pub fn with_gather_delay(mut self, delay: Option<Duration>) -> Self {
        self.gather_delay = delay;
        self
    }
}

impl Connector for LoopbackConnector {
    type Peer = LoopbackPeer;

    fn connect(&self, ice_servers: &[IceServer]) -> CapsuleResult<LoopbackPeer> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (gathering, _) = watch::channel(GatheringState::New);
        let inner = Arc::new(PeerInner {
            session_id: self.network.allocate_session_id(),
            network: self.network.clone(),
            gather_delay: self.gather_delay,
            shared: Mutex::new(PeerShared {
                local: None,
                remote: None,
                connection: PeerState::New,
                channels: Vec::new(),
                linked: Weak::new(),
            }),
            gathering,
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
        });
        self.network.register(&inner);
        debug!(
            session = %inner.session_id,
            ice_servers = ice_servers.len(),
            "loopback peer created"
        );
        Ok(LoopbackPeer(inner))
    }
}

struct PeerShared {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    connection: PeerState,
    channels: Vec<LoopbackChannel>,
    linked: Weak<PeerInner>,
}

struct PeerInner {
    session_id: String,
    network: LoopbackNetwork,
    gather_delay: Option<Duration>,
    shared: Mutex<PeerShared>,
    gathering: watch::Sender<GatheringState>,
    // Dropped on shutdown so a pending `next_incoming_channel` sees `None`
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<LoopbackChannel>>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LoopbackChannel>>,
}

impl PeerInner {
    fn describe(&self, sdp_type: SdpType) -> SessionDescription {
        let sdp = format!(
            "v=0\r\n\
             o=- {} 2 IN IP4 127.0.0.1\r\n\
             s=-\r\n\
             t=0 0\r\n\
             a=group:BUNDLE 0\r\n\
             m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
             c=IN IP4 0.0.0.0\r\n\
             a=mid:0\r\n\
             a=sctp-port:5000\r\n",
            self.session_id
        );
        SessionDescription::new(sdp_type, sdp)
    }

    fn finish_gathering(&self) {
        {
            let mut shared = locked(&self.shared);
            if let Some(local) = shared.local.as_mut() {
                local.sdp.push_str(&format!(
                    "a=candidate:1 1 udp 2122260223 127.0.0.1 {} typ host\r\na=end-of-candidates\r\n",
                    50000 + self.session_id.len()
                ));
            }
        }
        self.gathering.send_replace(GatheringState::Complete);
    }

    fn shut_down(&self, terminal: PeerState) {
        let (channels, linked) = {
            let mut shared = locked(&self.shared);
            if matches!(shared.connection, PeerState::Closed | PeerState::Failed) {
                return;
            }
            shared.connection = terminal;
            (std::mem::take(&mut shared.channels), shared.linked.upgrade())
        };
        locked(&self.incoming_tx).take();
        for channel in channels {
            channel.close();
        }
        if let Some(remote) = linked {
            remote.shut_down(terminal);
        }
    }
}

/// Session id from the SDP origin line: `o=- <session-id> ...`
fn session_id_of(desc: &SessionDescription) -> CapsuleResult<String> {
    desc.sdp
        .lines()
        .find_map(|line| line.strip_prefix("o="))
        .and_then(|origin| origin.split_whitespace().nth(1))
        .map(str::to_string)
        .ok_or_else(|| CapsuleError::Transport("description has no origin line".into()))
}

/// Loopback peer connection handle
#[derive(Clone)]
pub struct LoopbackPeer(Arc<PeerInner>);

impl LoopbackPeer {
    /// Link offerer `self` with the answerer that produced `answer`.
    fn link(&self, answer: &SessionDescription) -> CapsuleResult<()> {
        let remote_id = session_id_of(answer)?;
        let Some(remote) = self.0.network.lookup(&remote_id) else {
            locked(&self.0.shared).connection = PeerState::Failed;
            return Err(CapsuleError::Transport(format!(
                "no loopback peer with session {remote_id}"
            )));
        };

        let answered_us = locked(&remote.shared)
            .remote
            .as_ref()
            .and_then(|d| session_id_of(d).ok())
            .is_some_and(|id| id == self.0.session_id);
        if !answered_us {
            return Err(CapsuleError::Transport(
                "answer was not produced for this offer".into(),
            ));
        }

        let local_channels = {
            let mut shared = locked(&self.0.shared);
            shared.connection = PeerState::Connected;
            shared.linked = Arc::downgrade(&remote);
            shared.channels.clone()
        };
        {
            let mut shared = locked(&remote.shared);
            shared.connection = PeerState::Connected;
            shared.linked = Arc::downgrade(&self.0);
        }

        for local in local_channels {
            let counterpart = LoopbackChannel::new(local.label());
            LoopbackChannel::pair(&local, &counterpart);
            locked(&remote.shared).channels.push(counterpart.clone());
            if let Some(tx) = locked(&remote.incoming_tx).as_ref() {
                // Receiver lives as long as `remote`
                let _ = tx.send(counterpart);
            }
        }
        debug!(
            offerer = %self.0.session_id,
            answerer = %remote.session_id,
            "loopback peers linked"
        );
        Ok(())
    }
}

impl PeerConnection for LoopbackPeer {
    type Channel = LoopbackChannel;

    fn create_data_channel(&self, label: &str) -> CapsuleResult<LoopbackChannel> {
        let channel = LoopbackChannel::new(label);
        locked(&self.0.shared).channels.push(channel.clone());
        Ok(channel)
    }

    fn create_offer(&self) -> impl Future<Output = CapsuleResult<SessionDescription>> + Send {
        std::future::ready(Ok(self.0.describe(SdpType::Offer)))
    }

    fn create_answer(&self) -> impl Future<Output = CapsuleResult<SessionDescription>> + Send {
        let has_offer = locked(&self.0.shared)
            .remote
            .as_ref()
            .is_some_and(|d| d.sdp_type == SdpType::Offer);
        let result = if has_offer {
            Ok(self.0.describe(SdpType::Answer))
        } else {
            Err(CapsuleError::Transport(
                "create_answer requires a remote offer".into(),
            ))
        };
        std::future::ready(result)
    }

    fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> impl Future<Output = CapsuleResult<()>> + Send {
        {
            let mut shared = locked(&self.0.shared);
            shared.local = Some(desc);
            if shared.connection == PeerState::New {
                shared.connection = PeerState::Connecting;
            }
        }
        self.0.gathering.send_replace(GatheringState::Gathering);

        match self.0.gather_delay {
            Some(delay) if delay.is_zero() => self.0.finish_gathering(),
            Some(delay) => {
                let weak = Arc::downgrade(&self.0);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.finish_gathering();
                    }
                });
            }
            None => {}
        }
        std::future::ready(Ok(()))
    }

    fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> impl Future<Output = CapsuleResult<()>> + Send {
        let result = session_id_of(&desc).and_then(|_| {
            let sdp_type = desc.sdp_type;
            locked(&self.0.shared).remote = Some(desc.clone());
            match sdp_type {
                SdpType::Answer => self.link(&desc),
                SdpType::Offer => Ok(()),
            }
        });
        std::future::ready(result)
    }

    fn local_description(&self) -> Option<SessionDescription> {
        locked(&self.0.shared).local.clone()
    }

    fn gathering_state(&self) -> GatheringState {
        *self.0.gathering.borrow()
    }

    fn gathering_complete(&self) -> impl Future<Output = ()> + Send {
        let mut rx = self.0.gathering.subscribe();
        async move {
            loop {
                let done = *rx.borrow_and_update() == GatheringState::Complete;
                if done || rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    fn next_incoming_channel(&self) -> impl Future<Output = Option<LoopbackChannel>> + Send {
        let inner = Arc::clone(&self.0);
        async move { inner.incoming_rx.lock().await.recv().await }
    }

    fn connection_state(&self) -> PeerState {
        locked(&self.0.shared).connection
    }

    fn close(&self) {
        self.0.shut_down(PeerState::Closed);
    }
}

struct ChannelInner {
    label: String,
    state: Mutex<ReadyState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ChannelMessage>>>,
    // Handed to the counterpart when paired
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<ChannelMessage>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    counterpart: Mutex<Weak<ChannelInner>>,
}

impl ChannelInner {
    fn close_local(&self) {
        *locked(&self.state) = ReadyState::Closed;
        locked(&self.outbound).take();
        locked(&self.inbound_tx).take();
    }
}

/// Loopback data channel handle
#[derive(Clone)]
pub struct LoopbackChannel(Arc<ChannelInner>);

impl LoopbackChannel {
    fn new(label: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self(Arc::new(ChannelInner {
            label: label.to_string(),
            state: Mutex::new(ReadyState::Connecting),
            outbound: Mutex::new(None),
            inbound_tx: Mutex::new(Some(tx)),
            inbound: tokio::sync::Mutex::new(rx),
            counterpart: Mutex::new(Weak::new()),
        }))
    }

    fn pair(a: &LoopbackChannel, b: &LoopbackChannel) {
        *locked(&a.0.outbound) = locked(&b.0.inbound_tx).take();
        *locked(&b.0.outbound) = locked(&a.0.inbound_tx).take();
        *locked(&a.0.counterpart) = Arc::downgrade(&b.0);
        *locked(&b.0.counterpart) = Arc::downgrade(&a.0);
        *locked(&a.0.state) = ReadyState::Open;
        *locked(&b.0.state) = ReadyState::Open;
    }

    fn try_send(&self, msg: ChannelMessage) -> CapsuleResult<()> {
        if *locked(&self.0.state) != ReadyState::Open {
            return Err(CapsuleError::NotConnected);
        }
        locked(&self.0.outbound)
            .as_ref()
            .ok_or(CapsuleError::NotConnected)?
            .send(msg)
            .map_err(|_| CapsuleError::Transport("remote end of the channel is gone".into()))
    }
}

impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.0.label
    }

    fn ready_state(&self) -> ReadyState {
        *locked(&self.0.state)
    }

    fn send(&self, msg: ChannelMessage) -> impl Future<Output = CapsuleResult<()>> + Send {
        std::future::ready(self.try_send(msg))
    }

    fn recv(&self) -> impl Future<Output = Option<ChannelMessage>> + Send {
        let inner = Arc::clone(&self.0);
        async move { inner.inbound.lock().await.recv().await }
    }

    fn close(&self) {
        self.0.close_local();
        let counterpart = locked(&self.0.counterpart).upgrade();
        if let Some(other) = counterpart {
            other.close_local();
        }
    }
}
