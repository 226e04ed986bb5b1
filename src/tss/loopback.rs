// src/tss/loopback.rs
//! Deterministic in-process protocol engine.
//!
//! This is NOT a threshold scheme: the group secret is derived from public
//! session inputs, so every party can compute it. What it does provide is the
//! full message choreography of a real engine (setup bytes, per-peer
//! commitments, a self-addressed ack, a finished signal, real secp256k1
//! outputs), which lets the session core, transport and stores run end-to-end
//! in tests and local development. A production deployment injects a real
//! DKLS engine behind the same trait.

use crate::tss::engine::{
    OutgoingMessage, ProtocolEngine, ProtocolOutput, ProtocolSession, SessionInputs, SessionParams,
};
use crate::tss::wire::WireProtocol;
use anyhow::{anyhow, bail, Result};
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

pub struct LoopbackEngine;

impl LoopbackEngine {
    pub fn new() -> Self {
        Self
    }

    /// Group secret: H(tag || key_id || sorted parties), re-hashed until it
    /// lands inside the curve order. Deterministic across all parties.
    fn group_signing_key(key_id: &str, parties: &[String]) -> Result<SigningKey> {
        let mut digest = {
            let mut h = Sha256::new();
            h.update(b"loopback-group-key");
            h.update(key_id.as_bytes());
            for p in parties {
                h.update(p.as_bytes());
            }
            h.finalize()
        };
        loop {
            if let Ok(key) = SigningKey::from_bytes(&digest) {
                return Ok(key);
            }
            digest = Sha256::digest(digest);
        }
    }

    fn share_bytes(key_id: &str, party: &str) -> Vec<u8> {
        let mut h = Sha256::new();
        h.update(b"loopback-share");
        h.update(key_id.as_bytes());
        h.update(party.as_bytes());
        h.finalize().to_vec()
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn setup_digest(protocol: WireProtocol, params: &SessionParams) -> Vec<u8> {
    let mut h = Sha256::new();
    h.update(b"loopback-setup");
    h.update(protocol.to_string().as_bytes());
    h.update(params.event_id.as_bytes());
    h.update(params.key_id.as_bytes());
    h.update(params.threshold.to_be_bytes());
    for p in &params.parties {
        h.update(p.as_bytes());
    }
    h.finalize().to_vec()
}

impl ProtocolEngine for LoopbackEngine {
    fn build_setup(&self, protocol: WireProtocol, params: &SessionParams) -> Result<Vec<u8>> {
        Ok(setup_digest(protocol, params))
    }

    fn open_session(
        &self,
        protocol: WireProtocol,
        params: &SessionParams,
        inputs: SessionInputs,
    ) -> Result<Box<dyn ProtocolSession>> {
        if !params.parties.contains(&params.local_party) {
            bail!("local party {} not in session parties", params.local_party);
        }
        match protocol {
            WireProtocol::Sign => {
                if inputs.share.as_deref().unwrap_or_default().is_empty() {
                    bail!("sign session requires an existing keyshare");
                }
                let hash = inputs
                    .message_hash
                    .as_deref()
                    .ok_or_else(|| anyhow!("sign session requires a message hash"))?;
                if hash.len() != 32 {
                    bail!("message hash must be 32 bytes, got {}", hash.len());
                }
            }
            WireProtocol::Keyrefresh => {
                if inputs.share.as_deref().unwrap_or_default().is_empty() {
                    bail!("refresh session requires an existing keyshare");
                }
            }
            WireProtocol::Keygen => {}
        }
        Ok(Box::new(LoopbackSession {
            protocol,
            params: params.clone(),
            inputs,
            setup_applied: false,
            emitted: false,
            seen_commitments: HashSet::new(),
            self_acked: false,
        }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LoopbackMessage {
    from: String,
    commitment: String,
}

struct LoopbackSession {
    protocol: WireProtocol,
    params: SessionParams,
    inputs: SessionInputs,
    setup_applied: bool,
    emitted: bool,
    seen_commitments: HashSet<String>,
    self_acked: bool,
}

impl LoopbackSession {
    fn commitment_for(&self, party: &str) -> String {
        let mut h = Sha256::new();
        h.update(b"loopback-commitment");
        h.update(self.params.event_id.as_bytes());
        h.update(party.as_bytes());
        hex::encode(h.finalize())
    }
}

impl ProtocolSession for LoopbackSession {
    fn apply_setup(&mut self, data: &[u8]) -> Result<()> {
        let expected = setup_digest(self.protocol, &self.params);
        if data != expected.as_slice() {
            bail!("setup bytes do not match session parameters");
        }
        self.setup_applied = true;
        Ok(())
    }

    fn pull_outgoing(&mut self) -> Result<Vec<OutgoingMessage>> {
        if !self.setup_applied {
            bail!("session used before setup");
        }
        if self.emitted {
            return Ok(Vec::new());
        }
        self.emitted = true;
        let commitment = self.commitment_for(&self.params.local_party);
        let mut out = Vec::new();
        // One commitment per party, the local one included: the self-addressed
        // message exercises the local enqueue path in the session core.
        for party in &self.params.parties {
            let msg = LoopbackMessage {
                from: self.params.local_party.clone(),
                commitment: commitment.clone(),
            };
            out.push(OutgoingMessage {
                receiver: party.clone(),
                payload: serde_json::to_vec(&msg)?,
            });
        }
        Ok(out)
    }

    fn push_incoming(&mut self, payload: &[u8]) -> Result<()> {
        if !self.setup_applied {
            bail!("session used before setup");
        }
        let msg: LoopbackMessage = serde_json::from_slice(payload)?;
        if !self.params.parties.contains(&msg.from) {
            bail!("commitment from unknown party {}", msg.from);
        }
        if msg.commitment != self.commitment_for(&msg.from) {
            bail!("bad commitment from {}", msg.from);
        }
        if msg.from == self.params.local_party {
            self.self_acked = true;
        } else {
            self.seen_commitments.insert(msg.from);
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.self_acked && self.seen_commitments.len() == self.params.parties.len() - 1
    }

    fn finish(self: Box<Self>) -> Result<ProtocolOutput> {
        if !self.is_finished() {
            bail!("session finished early: missing commitments");
        }
        let group = LoopbackEngine::group_signing_key(&self.params.key_id, &self.params.parties)?;
        match self.protocol {
            WireProtocol::Keygen | WireProtocol::Keyrefresh => Ok(ProtocolOutput::Key {
                public_key: group
                    .verifying_key()
                    .to_encoded_point(true)
                    .as_bytes()
                    .to_vec(),
                share: LoopbackEngine::share_bytes(&self.params.key_id, &self.params.local_party),
            }),
            WireProtocol::Sign => {
                let hash = self.inputs.message_hash.as_deref().unwrap_or_default();
                let sig: Signature = group.sign_prehash(hash)?;
                Ok(ProtocolOutput::Signature(sig.to_vec()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::signature::hazmat::PrehashVerifier;
    use k256::ecdsa::VerifyingKey;

    fn params(local: &str) -> SessionParams {
        SessionParams {
            event_id: "ev-1".into(),
            key_id: "key-1".into(),
            threshold: 2,
            parties: vec!["a".into(), "b".into(), "c".into()],
            local_party: local.into(),
        }
    }

    /// Run all three parties to completion by hand-routing messages.
    fn run_all(protocol: WireProtocol, inputs: impl Fn() -> SessionInputs) -> Vec<ProtocolOutput> {
        let engine = LoopbackEngine::new();
        let setup = engine.build_setup(protocol, &params("a")).unwrap();
        let mut sessions: Vec<(String, Box<dyn ProtocolSession>)> = ["a", "b", "c"]
            .iter()
            .map(|p| {
                let mut s = engine.open_session(protocol, &params(p), inputs()).unwrap();
                s.apply_setup(&setup).unwrap();
                (p.to_string(), s)
            })
            .collect();

        let mut inboxes: std::collections::HashMap<String, Vec<Vec<u8>>> = Default::default();
        for (_, session) in sessions.iter_mut() {
            for msg in session.pull_outgoing().unwrap() {
                inboxes.entry(msg.receiver).or_default().push(msg.payload);
            }
        }
        sessions
            .into_iter()
            .map(|(party, mut session)| {
                for payload in inboxes.get(&party).unwrap() {
                    session.push_incoming(payload).unwrap();
                }
                assert!(session.is_finished());
                session.finish().unwrap()
            })
            .collect()
    }

    #[test]
    fn keygen_agrees_on_public_key_with_unique_shares() {
        let outputs = run_all(WireProtocol::Keygen, SessionInputs::default);
        let mut pubkeys = Vec::new();
        let mut shares = Vec::new();
        for out in outputs {
            match out {
                ProtocolOutput::Key { public_key, share } => {
                    pubkeys.push(public_key);
                    shares.push(share);
                }
                _ => panic!("expected key output"),
            }
        }
        assert!(pubkeys.windows(2).all(|w| w[0] == w[1]));
        shares.sort();
        shares.dedup();
        assert_eq!(shares.len(), 3, "each party must hold a distinct share");
    }

    #[test]
    fn sign_produces_verifiable_signature() {
        let hash = Sha256::digest(b"outbound tx").to_vec();
        let inputs = || SessionInputs {
            share: Some(vec![1u8; 32]),
            message_hash: Some(hash.clone()),
            derivation_path: None,
        };
        let outputs = run_all(WireProtocol::Sign, inputs);
        let group =
            LoopbackEngine::group_signing_key("key-1", &["a".into(), "b".into(), "c".into()])
                .unwrap();
        let verifying: VerifyingKey = *group.verifying_key();
        for out in outputs {
            match out {
                ProtocolOutput::Signature(bytes) => {
                    let sig = Signature::from_slice(&bytes).unwrap();
                    verifying.verify_prehash(&hash, &sig).unwrap();
                }
                _ => panic!("expected signature output"),
            }
        }
    }

    #[test]
    fn sign_requires_share_and_hash() {
        let engine = LoopbackEngine::new();
        assert!(engine
            .open_session(WireProtocol::Sign, &params("a"), SessionInputs::default())
            .is_err());
        let no_hash = SessionInputs {
            share: Some(vec![1u8; 32]),
            ..Default::default()
        };
        assert!(engine
            .open_session(WireProtocol::Sign, &params("a"), no_hash)
            .is_err());
    }

    #[test]
    fn setup_bytes_are_checked() {
        let engine = LoopbackEngine::new();
        let mut session = engine
            .open_session(WireProtocol::Keygen, &params("a"), SessionInputs::default())
            .unwrap();
        assert!(session.apply_setup(b"garbage").is_err());
    }
}
