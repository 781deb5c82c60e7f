//! Offer/answer state machine for one connection attempt
//!
//! ## State Machine
//! ```text
//! New -> Gathering -> HaveLocalDescription -> Connected
//!                                         \-> Failed | Closed
//! ```
//!
//! Only one attempt is live per session: `create_offer`/`create_answer`
//! discard whatever came before. Terminal states never recover; the caller
//! starts a fresh attempt.

use std::time::Duration;

use capsule_core::config::SignalingConfig;
use capsule_core::{CapsuleError, CapsuleResult};
use capsule_crypto::SecretManager;
use tracing::{debug, info, warn};

use crate::blob::{Role, SignalingBlob};
use crate::transport::{Connector, DataChannel, PeerConnection, PeerState};

/// Data channel type produced by a connector
pub type ChannelOf<C> = <<C as Connector>::Peer as PeerConnection>::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Gathering,
    HaveLocalDescription,
    Connected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionState::New => "new",
            ConnectionState::Gathering => "gathering",
            ConnectionState::HaveLocalDescription => "have-local-description",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        })
    }
}

struct Attempt<P: PeerConnection> {
    role: Role,
    peer: P,
    channel: Option<P::Channel>,
    phase: ConnectionState,
    remote_applied: bool,
}

impl<P: PeerConnection> Attempt<P> {
    /// Own progress, overridden by what the transport reports once it
    /// has something to say.
    fn observed_state(&self) -> ConnectionState {
        if self.phase.is_terminal() {
            return self.phase;
        }
        match self.peer.connection_state() {
            PeerState::Connected => ConnectionState::Connected,
            PeerState::Failed => ConnectionState::Failed,
            PeerState::Closed => ConnectionState::Closed,
            PeerState::New | PeerState::Connecting | PeerState::Disconnected => self.phase,
        }
    }

    fn shut_down(&mut self, terminal: ConnectionState) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.peer.close();
        self.phase = terminal;
    }
}

/// Connection setup for one peer link
pub struct SignalingSession<C: Connector> {
    connector: C,
    secrets: SecretManager,
    config: SignalingConfig,
    attempt: Option<Attempt<C::Peer>>,
}

impl<C: Connector> SignalingSession<C> {
    pub fn new(connector: C, secrets: SecretManager, config: SignalingConfig) -> Self {
        Self {
            connector,
            secrets,
            config,
            attempt: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.attempt
            .as_ref()
            .map_or(ConnectionState::New, Attempt::observed_state)
    }

    /// Role of the current attempt, if any.
    pub fn role(&self) -> Option<Role> {
        self.attempt.as_ref().map(|a| a.role)
    }

    /// Start an attempt as the offerer and return the offer blob.
    ///
    /// Requires a room key. Opens the local data channel, then waits for
    /// candidate gathering or the configured timeout, whichever comes first.
    pub async fn create_offer(&mut self) -> CapsuleResult<SignalingBlob> {
        self.secrets.require_key()?;
        self.discard_attempt();

        let peer = self.connector.connect(&self.config.ice_servers)?;
        let channel = peer.create_data_channel(&self.config.channel_label)?;
        self.attempt = Some(Attempt {
            role: Role::Offerer,
            peer,
            channel: Some(channel),
            phase: ConnectionState::New,
            remote_applied: false,
        });

        let result = self.offer_steps().await;
        self.fail_on_error(result)
    }

    async fn offer_steps(&mut self) -> CapsuleResult<SignalingBlob> {
        let attempt = self.live_attempt()?;
        let offer = attempt.peer.create_offer().await?;
        attempt.peer.set_local_description(offer).await?;
        let blob = self.finish_local_description().await?;
        info!(role = %Role::Offerer, "offer created");
        Ok(blob)
    }

    /// Apply the answerer's blob to the outstanding offer.
    ///
    /// A malformed blob leaves the attempt untouched so the user can paste
    /// or scan again.
    pub async fn accept_answer(&mut self, text: &str) -> CapsuleResult<()> {
        let state = self.state();
        let attempt = self
            .attempt
            .as_mut()
            .ok_or_else(|| CapsuleError::InvalidState("no offer outstanding".into()))?;
        if attempt.role != Role::Offerer
            || attempt.remote_applied
            || state != ConnectionState::HaveLocalDescription
        {
            return Err(CapsuleError::InvalidState(format!(
                "cannot accept an answer as {} in state {state}",
                attempt.role
            )));
        }

        let blob = SignalingBlob::decode(text)?.expect_role(Role::Answerer)?;
        attempt
            .peer
            .set_remote_description(blob.into_description())
            .await?;
        attempt.remote_applied = true;
        info!("answer applied");
        Ok(())
    }

    /// Start an attempt as the answerer from the offerer's blob.
    ///
    /// The offer is validated before any prior attempt is discarded.
    pub async fn create_answer(&mut self, offer_text: &str) -> CapsuleResult<SignalingBlob> {
        self.secrets.require_key()?;
        let offer = SignalingBlob::decode(offer_text)?.expect_role(Role::Offerer)?;
        self.discard_attempt();

        let peer = self.connector.connect(&self.config.ice_servers)?;
        self.attempt = Some(Attempt {
            role: Role::Answerer,
            peer,
            channel: None,
            phase: ConnectionState::New,
            remote_applied: false,
        });

        let result = self.answer_steps(offer).await;
        self.fail_on_error(result)
    }

    async fn answer_steps(&mut self, offer: SignalingBlob) -> CapsuleResult<SignalingBlob> {
        let attempt = self.live_attempt()?;
        attempt
            .peer
            .set_remote_description(offer.into_description())
            .await?;
        attempt.remote_applied = true;
        let answer = attempt.peer.create_answer().await?;
        attempt.peer.set_local_description(answer).await?;
        let blob = self.finish_local_description().await?;
        info!(role = %Role::Answerer, "answer created");
        Ok(blob)
    }

    /// The shared data channel handle.
    ///
    /// The offerer gets the channel it opened; the answerer waits for the
    /// one the transport attaches when the remote side's channel arrives.
    pub async fn channel(&mut self) -> CapsuleResult<ChannelOf<C>> {
        if self.state().is_terminal() {
            return Err(CapsuleError::NotConnected);
        }
        let attempt = self.attempt.as_mut().ok_or(CapsuleError::NotConnected)?;
        if let Some(channel) = &attempt.channel {
            return Ok(channel.clone());
        }

        let channel = attempt
            .peer
            .next_incoming_channel()
            .await
            .ok_or(CapsuleError::NotConnected)?;
        debug!(label = channel.label(), "data channel attached");
        attempt.channel = Some(channel.clone());
        Ok(channel)
    }

    /// Tear down the current attempt. The state becomes `closed`.
    pub fn close(&mut self) {
        if let Some(attempt) = self.attempt.as_mut() {
            if !attempt.phase.is_terminal() {
                attempt.shut_down(ConnectionState::Closed);
                info!("connection closed");
            }
        }
    }

    fn discard_attempt(&mut self) {
        if let Some(mut previous) = self.attempt.take() {
            debug!(role = %previous.role, "discarding previous connection attempt");
            previous.shut_down(ConnectionState::Closed);
        }
    }

    fn live_attempt(&mut self) -> CapsuleResult<&mut Attempt<C::Peer>> {
        self.attempt
            .as_mut()
            .ok_or_else(|| CapsuleError::InvalidState("no connection attempt".into()))
    }

    /// Wait for gathering (bounded) and serialize the local description.
    async fn finish_local_description(&mut self) -> CapsuleResult<SignalingBlob> {
        let timeout = Duration::from_millis(self.config.gather_timeout_ms);
        let attempt = self.live_attempt()?;
        attempt.phase = ConnectionState::Gathering;

        if tokio::time::timeout(timeout, attempt.peer.gathering_complete())
            .await
            .is_err()
        {
            // Partial candidates still often connect
            debug!(
                timeout_ms = timeout.as_millis() as u64,
                "candidate gathering timed out, continuing with partial candidates"
            );
        }

        let description = attempt
            .peer
            .local_description()
            .ok_or_else(|| CapsuleError::Transport("no local description after gathering".into()))?;
        attempt.phase = ConnectionState::HaveLocalDescription;
        Ok(SignalingBlob::new(description))
    }

    fn fail_on_error<T>(&mut self, result: CapsuleResult<T>) -> CapsuleResult<T> {
        if let Err(e) = &result {
            warn!(error = %e, "connection attempt failed");
            if let Some(attempt) = self.attempt.as_mut() {
                attempt.shut_down(ConnectionState::Failed);
            }
        }
        result
    }
}
