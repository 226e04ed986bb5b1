// src/tss/wire.rs
//! Peer wire protocol: a single JSON envelope shared by every protocol run.
//!
//! The envelope is byte-compatible across daemon implementations, so the
//! field set is fixed. Opaque protocol bytes travel base64-encoded.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed wire envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("wire envelope has empty event_id")]
    EmptyEventId,
    #[error("setup envelope missing setup body")]
    MissingSetup,
    #[error("payload envelope missing payload body")]
    MissingPayload,
    #[error("invalid base64 in wire envelope: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Protocol discriminator on the wire. QUORUM_CHANGE events run as
/// `keyrefresh` sessions, so no fourth value exists here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    Keygen,
    Keyrefresh,
    Sign,
}

impl std::fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WireProtocol::Keygen => "keygen",
            WireProtocol::Keyrefresh => "keyrefresh",
            WireProtocol::Sign => "sign",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireKind {
    Setup,
    Payload,
}

/// Participant entry inside a setup envelope. Only the identity pair is
/// carried; dial addresses come from the event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireParticipant {
    pub party_id: String,
    pub peer_id: String,
}

/// Setup body authored by the elected coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSetup {
    pub key_id: String,
    pub threshold: u32,
    pub participants: Vec<WireParticipant>,
    /// Opaque protocol setup bytes, base64.
    pub data: String,
}

impl WireSetup {
    pub fn new(
        key_id: impl Into<String>,
        threshold: u32,
        participants: Vec<WireParticipant>,
        data: &[u8],
    ) -> Self {
        Self {
            key_id: key_id.into(),
            threshold,
            participants,
            data: BASE64.encode(data),
        }
    }

    pub fn data_bytes(&self) -> Result<Vec<u8>, WireError> {
        Ok(BASE64.decode(&self.data)?)
    }
}

/// The one envelope every daemon speaks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub protocol: WireProtocol,
    #[serde(rename = "type")]
    pub kind: WireKind,
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<WireSetup>,
    /// Opaque protocol message bytes, base64.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl WireEnvelope {
    pub fn setup(protocol: WireProtocol, event_id: impl Into<String>, setup: WireSetup) -> Self {
        Self {
            protocol,
            kind: WireKind::Setup,
            event_id: event_id.into(),
            setup: Some(setup),
            payload: None,
        }
    }

    pub fn payload(protocol: WireProtocol, event_id: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            protocol,
            kind: WireKind::Payload,
            event_id: event_id.into(),
            setup: None,
            payload: Some(BASE64.encode(payload)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate one envelope off the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let env: WireEnvelope = serde_json::from_slice(bytes)?;
        env.validate()?;
        Ok(env)
    }

    fn validate(&self) -> Result<(), WireError> {
        if self.event_id.is_empty() {
            return Err(WireError::EmptyEventId);
        }
        match self.kind {
            WireKind::Setup if self.setup.is_none() => Err(WireError::MissingSetup),
            WireKind::Payload if self.payload.is_none() => Err(WireError::MissingPayload),
            _ => Ok(()),
        }
    }

    pub fn payload_bytes(&self) -> Result<Vec<u8>, WireError> {
        let b64 = self.payload.as_ref().ok_or(WireError::MissingPayload)?;
        Ok(BASE64.decode(b64)?)
    }
}
