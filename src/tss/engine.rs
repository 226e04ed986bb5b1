// src/tss/engine.rs
//! Seam to the threshold-signing protocol library.
//!
//! The daemon treats the protocol itself as opaque: an engine builds setup
//! bytes and opens sessions, a session pumps messages until it reports
//! finished and yields either key material or a signature. Everything the
//! session emits or consumes travels as raw bytes; routing is the session
//! core's job.

use crate::tss::wire::WireProtocol;
use anyhow::Result;

/// Inputs shared by every session of one run.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub event_id: String,
    pub key_id: String,
    pub threshold: u32,
    /// Party ids, sorted; the protocol's participant order.
    pub parties: Vec<String>,
    pub local_party: String,
}

/// Per-kind extras handed to `open_session`.
#[derive(Debug, Clone, Default)]
pub struct SessionInputs {
    /// Existing keyshare, required for refresh and sign.
    pub share: Option<Vec<u8>>,
    /// 32-byte message hash, required for sign.
    pub message_hash: Option<Vec<u8>>,
    /// Optional chain derivation path for sign.
    pub derivation_path: Option<String>,
}

/// One message the session wants delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Receiving party id; may equal the local party.
    pub receiver: String,
    pub payload: Vec<u8>,
}

/// What a finished session produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOutput {
    /// Keygen / refresh: the group public key (SEC1 compressed) and this
    /// party's share, ready for the keyshare store.
    Key { public_key: Vec<u8>, share: Vec<u8> },
    /// Sign: the finished signature bytes.
    Signature(Vec<u8>),
}

/// A single protocol run on one node.
pub trait ProtocolSession: Send {
    /// Initialise from the coordinator's opaque setup bytes.
    fn apply_setup(&mut self, data: &[u8]) -> Result<()>;

    /// Drain the messages the session wants sent right now.
    fn pull_outgoing(&mut self) -> Result<Vec<OutgoingMessage>>;

    /// Feed one incoming payload into the session.
    fn push_incoming(&mut self, payload: &[u8]) -> Result<()>;

    fn is_finished(&self) -> bool;

    /// Consume the session and read back its product.
    fn finish(self: Box<Self>) -> Result<ProtocolOutput>;
}

/// Factory for sessions; one engine is shared by the whole daemon.
pub trait ProtocolEngine: Send + Sync {
    /// Build the opaque setup bytes the coordinator distributes for a run.
    fn build_setup(&self, protocol: WireProtocol, params: &SessionParams) -> Result<Vec<u8>>;

    /// Open the local session for a run.
    fn open_session(
        &self,
        protocol: WireProtocol,
        params: &SessionParams,
        inputs: SessionInputs,
    ) -> Result<Box<dyn ProtocolSession>>;
}
