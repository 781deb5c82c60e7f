//! Signaling blob: base64 of the JSON session description
//!
//! ```text
//! base64( {"type":"offer"|"answer","sdp":"v=0\r\n..."} )
//! ```
//!
//! The `type` field doubles as the role marker. There is no version field,
//! so any change to this shape breaks interoperability with older peers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use capsule_core::{CapsuleError, CapsuleResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description as produced by the host transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, sdp: impl Into<String>) -> Self {
        Self {
            sdp_type,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    fn of(sdp_type: SdpType) -> Self {
        match sdp_type {
            SdpType::Offer => Role::Offerer,
            SdpType::Answer => Role::Answerer,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Offerer => f.write_str("offerer"),
            Role::Answerer => f.write_str("answerer"),
        }
    }
}

/// Opaque text exchanged out of band to set up the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingBlob {
    description: SessionDescription,
}

impl SignalingBlob {
    pub fn new(description: SessionDescription) -> Self {
        Self { description }
    }

    /// Role of the side that produced this blob.
    pub fn role(&self) -> Role {
        Role::of(self.description.sdp_type)
    }

    pub fn description(&self) -> &SessionDescription {
        &self.description
    }

    pub fn into_description(self) -> SessionDescription {
        self.description
    }

    /// Encode to the text handed to the user or the QR renderer.
    pub fn encode(&self) -> CapsuleResult<String> {
        let json = serde_json::to_vec(&self.description)
            .map_err(|e| CapsuleError::MalformedBlob(format!("serializing description: {e}")))?;
        Ok(STANDARD.encode(json))
    }

    /// Decode pasted or scanned text.
    ///
    /// Whitespace anywhere in the text is ignored; pasting and QR scanners
    /// both tend to add line breaks.
    pub fn decode(text: &str) -> CapsuleResult<Self> {
        let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        if compact.is_empty() {
            return Err(CapsuleError::MalformedBlob("empty blob".into()));
        }

        let json = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| CapsuleError::MalformedBlob(format!("base64: {e}")))?;
        let description: SessionDescription = serde_json::from_slice(&json)
            .map_err(|e| CapsuleError::MalformedBlob(format!("description JSON: {e}")))?;

        if description.sdp.trim().is_empty() {
            return Err(CapsuleError::MalformedBlob("description has no sdp".into()));
        }
        Ok(Self { description })
    }

    /// Reject a blob produced by the wrong side (e.g. an offer pasted as answer).
    pub fn expect_role(self, expected: Role) -> CapsuleResult<Self> {
        if self.role() != expected {
            return Err(CapsuleError::InvalidState(format!(
                "expected a blob from the {expected}, got one from the {}",
                self.role()
            )));
        }
        Ok(self)
    }
}
