// src/tss/session.rs
//! Per-event protocol sessions.
//!
//! One in-memory session exists per `(protocol, event_id)` while a run is
//! active: a single-slot channel for the coordinator's setup envelope and a
//! buffered channel for protocol payloads. The event store stays the source
//! of truth; when a wire message arrives for a session this node does not
//! know, the core rebuilds it from the event row so a restarted node can
//! catch up with an in-flight run.

use crate::keyshare::KeyshareStore;
use crate::store::{Event, EventStatus, EventStore, EventType};
use crate::transport::Transport;
use crate::tss::engine::{
    ProtocolEngine, ProtocolOutput, SessionInputs, SessionParams,
};
use crate::tss::party::{Participant, PartyError, PartySet};
use crate::tss::wire::{WireEnvelope, WireKind, WireProtocol, WireParticipant, WireSetup};
use crate::tss::TssError;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const PAYLOAD_CHANNEL_CAPACITY: usize = 256;
const PEER_RETRY_ATTEMPTS: u32 = 3;
const PEER_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const SEND_RETRY_ATTEMPTS: u32 = 3;
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Session-core tuning; defaults match the daemon's shipped configuration.
#[derive(Debug, Clone)]
pub struct TssConfig {
    /// This node's home-chain validator identity.
    pub local_party_id: String,
    /// Grace sleep before the coordinator broadcasts setup, so slower peers
    /// can register their sessions first.
    pub setup_grace: Duration,
    pub setup_timeout: Duration,
    /// Bound on each wait for the next protocol payload.
    pub message_timeout: Duration,
}

impl TssConfig {
    pub fn new(local_party_id: impl Into<String>) -> Self {
        Self {
            local_party_id: local_party_id.into(),
            setup_grace: Duration::from_secs(5),
            setup_timeout: Duration::from_secs(30),
            message_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of a key ceremony.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCeremonyOutcome {
    pub key_id: String,
    /// Group public key, compressed SEC1.
    pub public_key: Vec<u8>,
}

type SessionKey = (WireProtocol, String);

struct SessionReceivers {
    setup_rx: mpsc::Receiver<WireSetup>,
    payload_rx: mpsc::Receiver<Vec<u8>>,
}

struct SessionEntry {
    setup_tx: mpsc::Sender<WireSetup>,
    payload_tx: mpsc::Sender<Vec<u8>>,
    /// Claimed by the task driving the run; `None` once taken.
    receivers: Mutex<Option<SessionReceivers>>,
    coordinator_peer: String,
    known_peers: HashSet<String>,
}

impl SessionEntry {
    fn new(party_set: &PartySet, local_party_id: &str, block_number: u64) -> Arc<Self> {
        let (setup_tx, setup_rx) = mpsc::channel(1);
        let (payload_tx, payload_rx) = mpsc::channel(PAYLOAD_CHANNEL_CAPACITY);
        let coordinator_peer = party_set.coordinator(block_number).peer_id.clone();
        let known_peers = party_set
            .remotes(local_party_id)
            .map(|p| p.peer_id.clone())
            .collect();
        Arc::new(Self {
            setup_tx,
            payload_tx,
            receivers: Mutex::new(Some(SessionReceivers { setup_rx, payload_rx })),
            coordinator_peer,
            known_peers,
        })
    }
}

pub struct SessionCore {
    cfg: TssConfig,
    engine: Arc<dyn ProtocolEngine>,
    transport: Arc<Transport>,
    keyshares: Arc<KeyshareStore>,
    store: Arc<EventStore>,
    // Lookups are reads; registration and removal are writes.
    sessions: RwLock<HashMap<SessionKey, Arc<SessionEntry>>>,
}

impl SessionCore {
    pub fn new(
        cfg: TssConfig,
        engine: Arc<dyn ProtocolEngine>,
        transport: Arc<Transport>,
        keyshares: Arc<KeyshareStore>,
        store: Arc<EventStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            engine,
            transport,
            keyshares,
            store,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Install this core as the transport's inbound handler.
    pub fn attach_transport(self: Arc<Self>) {
        let transport = self.transport.clone();
        transport.set_handler(Arc::new(move |peer, bytes| self.handle_frame(&peer, &bytes)));
    }

    /// Drive a KEYGEN / KEYREFRESH / QUORUM_CHANGE event to completion.
    pub async fn run_key_ceremony(&self, event: &Event) -> Result<KeyCeremonyOutcome, TssError> {
        let data = event.key_data()?;
        let protocol = wire_protocol_for(event.event_type);

        let inputs = match protocol {
            WireProtocol::Keygen => SessionInputs::default(),
            _ => {
                let prev = data.prev_key_id.as_deref().ok_or_else(|| TssError::Event {
                    event_id: event.event_id.clone(),
                    source: anyhow::anyhow!("refresh ceremony without prev_key_id"),
                })?;
                SessionInputs {
                    share: Some(self.keyshares.load(prev)?.share),
                    ..Default::default()
                }
            }
        };

        let output = self
            .run_protocol(
                protocol,
                event,
                &data.key_id,
                data.threshold,
                data.participants.clone(),
                inputs,
            )
            .await?;

        match output {
            ProtocolOutput::Key { public_key, share } => {
                self.keyshares.save(&data.key_id, &public_key, &share)?;
                // Read back: the stored share is what future sign sessions
                // will feed the engine.
                let stored = self.keyshares.load(&data.key_id)?;
                info!(key_id = %data.key_id, "keyshare stored");
                Ok(KeyCeremonyOutcome {
                    key_id: data.key_id,
                    public_key: stored.public_key,
                })
            }
            ProtocolOutput::Signature(_) => Err(TssError::Event {
                event_id: event.event_id.clone(),
                source: anyhow::anyhow!("key ceremony produced a signature"),
            }),
        }
    }

    /// Drive a SIGN event to completion; returns the signature bytes.
    pub async fn run_sign(&self, event: &Event) -> Result<Vec<u8>, TssError> {
        let data = event.sign_data()?;
        let share = self.keyshares.load(&data.key_id)?;
        let message_hash = hex::decode(&data.message_hash).map_err(|_| TssError::Event {
            event_id: event.event_id.clone(),
            source: anyhow::anyhow!("message hash is not hex"),
        })?;
        let inputs = SessionInputs {
            share: Some(share.share),
            message_hash: Some(message_hash),
            derivation_path: data.derivation_path.clone(),
        };

        let output = self
            .run_protocol(
                WireProtocol::Sign,
                event,
                &data.key_id,
                data.threshold,
                data.participants.clone(),
                inputs,
            )
            .await?;

        match output {
            ProtocolOutput::Signature(sig) => Ok(sig),
            ProtocolOutput::Key { .. } => Err(TssError::Event {
                event_id: event.event_id.clone(),
                source: anyhow::anyhow!("sign session produced key material"),
            }),
        }
    }

    async fn run_protocol(
        &self,
        protocol: WireProtocol,
        event: &Event,
        key_id: &str,
        threshold: u32,
        participants: Vec<Participant>,
        inputs: SessionInputs,
    ) -> Result<ProtocolOutput, TssError> {
        let party_set = PartySet::new(participants)?;
        let local = &self.cfg.local_party_id;
        if !party_set.contains(local) {
            return Err(TssError::Party(PartyError::LocalPartyMissing(local.clone())));
        }

        // Make every remote reachable before the protocol starts.
        for peer in party_set.remotes(local) {
            self.ensure_peer_with_retry(&peer.peer_id, &peer.addresses).await?;
        }

        let key: SessionKey = (protocol, event.event_id.clone());
        let entry = self.register_session(&key, &party_set, event.block_height);
        let mut receivers = entry
            .receivers
            .lock()
            .await
            .take()
            .ok_or_else(|| TssError::AlreadyRunning(event.event_id.clone()))?;

        let result = self
            .drive_session(
                protocol, event, key_id, threshold, &party_set, inputs, &entry, &mut receivers,
            )
            .await;

        self.sessions.write().remove(&key);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_session(
        &self,
        protocol: WireProtocol,
        event: &Event,
        key_id: &str,
        threshold: u32,
        party_set: &PartySet,
        inputs: SessionInputs,
        entry: &SessionEntry,
        receivers: &mut SessionReceivers,
    ) -> Result<ProtocolOutput, TssError> {
        let local = &self.cfg.local_party_id;
        let params = SessionParams {
            event_id: event.event_id.clone(),
            key_id: key_id.to_string(),
            threshold,
            parties: party_set.iter().map(|p| p.party_id.clone()).collect(),
            local_party: local.clone(),
        };

        let coordinator = party_set.coordinator(event.block_height);
        if coordinator.party_id == *local {
            // Grace period: give the other participants time to register
            // their sessions before the setup lands.
            sleep(self.cfg.setup_grace).await;
            let setup_data = self.engine.build_setup(protocol, &params)?;
            let setup = WireSetup::new(
                key_id,
                threshold,
                party_set
                    .iter()
                    .map(|p| WireParticipant {
                        party_id: p.party_id.clone(),
                        peer_id: p.peer_id.clone(),
                    })
                    .collect(),
                &setup_data,
            );
            let envelope = WireEnvelope::setup(protocol, &event.event_id, setup.clone());
            let bytes = envelope.encode().map_err(anyhow::Error::from)?;
            for peer in party_set.remotes(local) {
                self.send_with_retry(&peer.peer_id, &bytes).await?;
            }
            // The coordinator's own session consumes the same envelope.
            let _ = entry.setup_tx.try_send(setup);
            info!(event_id = %event.event_id, %protocol, "setup broadcast as coordinator");
        } else {
            debug!(
                event_id = %event.event_id,
                coordinator = %coordinator.party_id,
                "waiting for setup"
            );
        }

        let setup = match timeout(self.cfg.setup_timeout, receivers.setup_rx.recv()).await {
            Ok(Some(setup)) => setup,
            Ok(None) => return Err(TssError::ChannelClosed),
            Err(_) => return Err(TssError::SetupTimeout(self.cfg.setup_timeout)),
        };

        let mut session = self.engine.open_session(protocol, &params, inputs)?;
        session.apply_setup(&setup.data_bytes().map_err(anyhow::Error::from)?)?;

        loop {
            for msg in session.pull_outgoing()? {
                if msg.receiver == *local {
                    entry
                        .payload_tx
                        .send(msg.payload)
                        .await
                        .map_err(|_| TssError::ChannelClosed)?;
                    continue;
                }
                let peer = party_set
                    .get(&msg.receiver)
                    .ok_or_else(|| TssError::UnknownReceiver(msg.receiver.clone()))?;
                let bytes = WireEnvelope::payload(protocol, &event.event_id, &msg.payload)
                    .encode()
                    .map_err(anyhow::Error::from)?;
                self.send_with_retry(&peer.peer_id, &bytes).await?;
            }

            if session.is_finished() {
                break;
            }

            let payload = match timeout(self.cfg.message_timeout, receivers.payload_rx.recv()).await
            {
                Ok(Some(payload)) => payload,
                Ok(None) => return Err(TssError::ChannelClosed),
                Err(_) => return Err(TssError::PayloadTimeout(self.cfg.message_timeout)),
            };
            session.push_incoming(&payload)?;
        }

        // Final drain: a finishing step may still owe messages to peers that
        // have not finished yet.
        for msg in session.pull_outgoing()? {
            if msg.receiver == *local {
                continue;
            }
            if let Some(peer) = party_set.get(&msg.receiver) {
                let bytes = WireEnvelope::payload(protocol, &event.event_id, &msg.payload)
                    .encode()
                    .map_err(anyhow::Error::from)?;
                self.send_with_retry(&peer.peer_id, &bytes).await?;
            }
        }

        Ok(session.finish()?)
    }

    async fn ensure_peer_with_retry(
        &self,
        peer_id: &str,
        addresses: &[String],
    ) -> Result<(), TssError> {
        let mut last = String::new();
        for attempt in 1..=PEER_RETRY_ATTEMPTS {
            match self.transport.ensure_peer(peer_id, addresses).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last = format!("{e:#}");
                    if attempt < PEER_RETRY_ATTEMPTS {
                        sleep(PEER_RETRY_BACKOFF * attempt).await;
                    }
                }
            }
        }
        Err(TssError::PeerUnreachable {
            peer: peer_id.to_string(),
            reason: last,
        })
    }

    async fn send_with_retry(&self, peer_id: &str, bytes: &[u8]) -> Result<(), TssError> {
        let mut last = String::new();
        for attempt in 1..=SEND_RETRY_ATTEMPTS {
            match self.transport.send(peer_id, bytes.to_vec()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last = format!("{e:#}");
                    if attempt < SEND_RETRY_ATTEMPTS {
                        sleep(SEND_RETRY_BACKOFF * attempt).await;
                    }
                }
            }
        }
        Err(TssError::PeerUnreachable {
            peer: peer_id.to_string(),
            reason: last,
        })
    }

    fn register_session(
        &self,
        key: &SessionKey,
        party_set: &PartySet,
        block_number: u64,
    ) -> Arc<SessionEntry> {
        let mut sessions = self.sessions.write();
        sessions
            .entry(key.clone())
            .or_insert_with(|| SessionEntry::new(party_set, &self.cfg.local_party_id, block_number))
            .clone()
    }

    /// Transport callback: authenticate, route, or rebuild-and-route.
    pub fn handle_frame(&self, from_peer: &str, bytes: &[u8]) {
        let envelope = match WireEnvelope::decode(bytes) {
            Ok(env) => env,
            Err(e) => {
                warn!(peer = %from_peer, "dropping invalid wire envelope: {e}");
                return;
            }
        };
        let key: SessionKey = (envelope.protocol, envelope.event_id.clone());

        let entry = self.sessions.read().get(&key).cloned();
        let entry = match entry {
            Some(entry) => entry,
            None => match self.recover_session(&key) {
                Some(entry) => entry,
                None => {
                    debug!(
                        event_id = %envelope.event_id,
                        peer = %from_peer,
                        "dropping message for unknown session"
                    );
                    return;
                }
            },
        };

        if !entry.known_peers.contains(from_peer) {
            warn!(
                event_id = %envelope.event_id,
                peer = %from_peer,
                "dropping message from peer outside the participant set"
            );
            return;
        }

        match envelope.kind {
            WireKind::Setup => {
                if from_peer != entry.coordinator_peer {
                    warn!(
                        event_id = %envelope.event_id,
                        peer = %from_peer,
                        coordinator = %entry.coordinator_peer,
                        "dropping setup from non-coordinator"
                    );
                    return;
                }
                if let Some(setup) = envelope.setup {
                    // Single-slot: a duplicate setup is dropped.
                    if entry.setup_tx.try_send(setup).is_err() {
                        debug!(event_id = %envelope.event_id, "duplicate setup dropped");
                    }
                }
            }
            WireKind::Payload => {
                let payload = match envelope.payload_bytes() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(peer = %from_peer, "bad payload encoding: {e}");
                        return;
                    }
                };
                if entry.payload_tx.try_send(payload).is_err() {
                    warn!(
                        event_id = %envelope.event_id,
                        "payload channel full or closed; message dropped"
                    );
                }
            }
        }
    }

    /// A message arrived for a session this node has not started. If the
    /// event exists and is still pending pickup, rebuild the session from its
    /// stored participant list so the run can catch up once the poll loop
    /// claims it.
    fn recover_session(&self, key: &SessionKey) -> Option<Arc<SessionEntry>> {
        let (protocol, event_id) = key;
        let event = self.store.get_event(event_id).ok()?;
        if event.status != EventStatus::Confirmed {
            return None;
        }
        if wire_protocol_for(event.event_type) != *protocol {
            return None;
        }
        let participants = match event.event_type {
            EventType::Sign => event.sign_data().ok()?.participants,
            _ => event.key_data().ok()?.participants,
        };
        let party_set = PartySet::new(participants).ok()?;
        if !party_set.contains(&self.cfg.local_party_id) {
            return None;
        }
        info!(event_id = %event_id, "rebuilt session from event store for in-flight run");
        Some(self.register_session(key, &party_set, event.block_height))
    }
}

fn wire_protocol_for(event_type: EventType) -> WireProtocol {
    match event_type {
        EventType::Keygen => WireProtocol::Keygen,
        EventType::Keyrefresh | EventType::QuorumChange => WireProtocol::Keyrefresh,
        EventType::Sign => WireProtocol::Sign,
    }
}
