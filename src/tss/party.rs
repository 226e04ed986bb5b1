// src/tss/party.rs
// Participant set handling and deterministic coordinator election.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartyError {
    #[error("duplicate party id {0}")]
    DuplicateParty(String),
    #[error("participant {0} has no peer id")]
    MissingPeer(String),
    #[error("participant {0} has no addresses")]
    MissingAddrs(String),
    #[error("participant set is empty")]
    Empty,
    #[error("local party {0} not in participant set")]
    LocalPartyMissing(String),
}

/// One protocol participant as carried in event payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    /// Home-chain validator identity, the sort key of the set.
    pub party_id: String,
    /// Transport identity (hex Ed25519 public key).
    pub peer_id: String,
    /// Dial addresses for the peer, `host:port`.
    pub addresses: Vec<String>,
}

/// Immutable, validated, `party_id`-ordered view of one session's
/// participants.
#[derive(Debug, Clone)]
pub struct PartySet {
    parties: Vec<Participant>,
    index: HashMap<String, usize>,
}

impl PartySet {
    /// Build a set from an event's participant list: rejects duplicates and
    /// incomplete entries, sorts by `party_id`.
    pub fn new(mut parties: Vec<Participant>) -> Result<Self, PartyError> {
        if parties.is_empty() {
            return Err(PartyError::Empty);
        }
        parties.sort_by(|a, b| a.party_id.cmp(&b.party_id));
        let mut index = HashMap::with_capacity(parties.len());
        for (i, p) in parties.iter().enumerate() {
            if p.peer_id.is_empty() {
                return Err(PartyError::MissingPeer(p.party_id.clone()));
            }
            if p.addresses.is_empty() {
                return Err(PartyError::MissingAddrs(p.party_id.clone()));
            }
            if index.insert(p.party_id.clone(), i).is_some() {
                return Err(PartyError::DuplicateParty(p.party_id.clone()));
            }
        }
        Ok(Self { parties, index })
    }

    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.parties.iter()
    }

    pub fn contains(&self, party_id: &str) -> bool {
        self.index.contains_key(party_id)
    }

    pub fn get(&self, party_id: &str) -> Option<&Participant> {
        self.index.get(party_id).map(|&i| &self.parties[i])
    }

    /// Zero-based position of a party in the sorted order.
    pub fn position(&self, party_id: &str) -> Option<usize> {
        self.index.get(party_id).copied()
    }

    pub fn by_peer(&self, peer_id: &str) -> Option<&Participant> {
        self.parties.iter().find(|p| p.peer_id == peer_id)
    }

    /// All participants except `party_id`.
    pub fn remotes<'a>(&'a self, party_id: &'a str) -> impl Iterator<Item = &'a Participant> {
        self.parties.iter().filter(move |p| p.party_id != party_id)
    }

    /// Elect the session coordinator: the participant at index
    /// `block_number mod N` in `party_id` order. Every node computes the same
    /// answer from the same inputs, so no leader-election round is needed.
    pub fn coordinator(&self, block_number: u64) -> &Participant {
        let idx = (block_number % self.parties.len() as u64) as usize;
        &self.parties[idx]
    }

    /// Whether the local party is the coordinator for `block_number`.
    pub fn is_coordinator(&self, local_party_id: &str, block_number: u64) -> bool {
        self.coordinator(block_number).party_id == local_party_id
    }
}
