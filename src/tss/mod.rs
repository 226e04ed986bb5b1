// src/tss/mod.rs
//! Threshold-signing coordination: participant sets, the wire codec, the
//! protocol engine seam and the per-event session core.

pub mod engine;
pub mod loopback;
pub mod party;
pub mod session;
pub mod wire;

pub use self::session::{SessionCore, TssConfig};

use crate::keyshare::KeyshareError;
use crate::store::StoreError;
use self::party::PartyError;
use std::time::Duration;
use thiserror::Error;

/// Session-level failures. Timeouts and missing parties get distinct
/// variants because the revert handler and logs treat them differently.
#[derive(Debug, Error)]
pub enum TssError {
    #[error("setup timed out after {0:?}")]
    SetupTimeout(Duration),
    #[error("payload wait timed out after {0:?}")]
    PayloadTimeout(Duration),
    #[error(transparent)]
    Party(#[from] PartyError),
    #[error("cannot reach peer {peer}: {reason}")]
    PeerUnreachable { peer: String, reason: String },
    #[error("protocol message addressed to unknown party {0}")]
    UnknownReceiver(String),
    #[error("session for event {0} is already running")]
    AlreadyRunning(String),
    #[error("session channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Keyshare(#[from] KeyshareError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("event {event_id}: {source}")]
    Event {
        event_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Protocol(#[from] anyhow::Error),
}
