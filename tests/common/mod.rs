// tests/common/mod.rs
// Shared stubs and builders for the integration tests.
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uv_node::chain::grants::REQUIRED_GRANTS;
use uv_node::chain::signer::TxSigner;
use uv_node::chain::votes::VoteClient;
use uv_node::chain::{AccountInfo, GrantRecord, HomeChain, TxResponse};
use uv_node::foreign::{ForeignChain, TxVerification};
use uv_node::keyring::{HotKey, Keyring, KeyringBackend};
use uv_node::store::{Event, EventStatus, EventStore, EventType, KeyEventData, SignEventData};
use uv_node::tss::party::Participant;

pub const GRANTER: &str = "pc1granter";
pub const CHAIN_ID: &str = "uv_9000-1";

/// Home-chain stub that accepts everything and records decoded txs.
pub struct RecordingChain {
    pub height: AtomicU64,
    pub txs: Mutex<Vec<serde_json::Value>>,
    sequence: AtomicU64,
}

impl RecordingChain {
    pub fn new(height: u64) -> Arc<Self> {
        Arc::new(Self {
            height: AtomicU64::new(height),
            txs: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn memos(&self) -> Vec<String> {
        self.txs
            .lock()
            .iter()
            .map(|tx| tx["body"]["memo"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    /// Inner (post-envelope) messages of every recorded tx.
    pub fn inner_msgs(&self) -> Vec<serde_json::Value> {
        self.txs
            .lock()
            .iter()
            .map(|tx| tx["body"]["messages"][0]["msgs"][0].clone())
            .collect()
    }
}

#[async_trait]
impl HomeChain for RecordingChain {
    async fn account(&self, _address: &str) -> Result<AccountInfo> {
        Ok(AccountInfo {
            account_number: 1,
            sequence: self.sequence.load(Ordering::SeqCst),
        })
    }

    async fn grantee_grants(&self, grantee: &str) -> Result<Vec<GrantRecord>> {
        Ok(REQUIRED_GRANTS
            .iter()
            .map(|msg| GrantRecord {
                granter: GRANTER.to_string(),
                grantee: grantee.to_string(),
                msg_type_url: Some(msg.to_string()),
                expiration: None,
            })
            .collect())
    }

    async fn broadcast_tx_sync(&self, tx_bytes: Vec<u8>) -> Result<TxResponse> {
        let tx: serde_json::Value = serde_json::from_slice(&tx_bytes)?;
        self.txs.lock().push(tx);
        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        Ok(TxResponse {
            code: 0,
            txhash: format!("HOMEHASH{n}"),
            raw_log: String::new(),
        })
    }

    async fn latest_block_height(&self) -> Result<u64> {
        Ok(self.height.load(Ordering::SeqCst))
    }
}

/// Scripted destination-chain stub.
pub struct StubForeign {
    /// Raw hash handed back by `broadcast_signed_tx`.
    pub raw_hash: String,
    pub verification: Mutex<Option<TxVerification>>,
    /// `(message_hash, signature)` pairs broadcast through this stub.
    pub broadcasts: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    pub fail_verify: Mutex<bool>,
}

impl StubForeign {
    pub fn new(raw_hash: &str) -> Arc<Self> {
        Arc::new(Self {
            raw_hash: raw_hash.to_string(),
            verification: Mutex::new(Some(TxVerification::not_found())),
            broadcasts: Mutex::new(Vec::new()),
            fail_verify: Mutex::new(false),
        })
    }

    pub fn script_verification(&self, v: TxVerification) {
        *self.verification.lock() = Some(v);
    }

    pub fn fail_verification(&self) {
        *self.fail_verify.lock() = true;
    }
}

#[async_trait]
impl ForeignChain for StubForeign {
    async fn broadcast_signed_tx(&self, message_hash: &[u8], signature: &[u8]) -> Result<String> {
        self.broadcasts
            .lock()
            .push((message_hash.to_vec(), signature.to_vec()));
        Ok(self.raw_hash.clone())
    }

    async fn verify_broadcasted_tx(&self, _raw_hash: &str) -> Result<TxVerification> {
        if *self.fail_verify.lock() {
            bail!("rpc connection refused");
        }
        Ok(self.verification.lock().clone().expect("verification scripted"))
    }
}

/// A hot key in a throwaway test keyring.
pub fn test_hot_key() -> HotKey {
    let dir = tempfile::tempdir().unwrap();
    let ring = Keyring::open(dir.path(), KeyringBackend::Test, None).unwrap();
    ring.create_key("hotkey").unwrap()
}

pub fn vote_client(chain: Arc<RecordingChain>) -> Arc<VoteClient> {
    let signer = Arc::new(TxSigner::new(chain, test_hot_key(), GRANTER, CHAIN_ID));
    Arc::new(VoteClient::new(signer))
}

pub fn participant(party_id: &str, peer_id: &str, addr: &str) -> Participant {
    Participant {
        party_id: party_id.to_string(),
        peer_id: peer_id.to_string(),
        addresses: vec![addr.to_string()],
    }
}

pub fn sign_event(
    event_id: &str,
    block: u64,
    expiry: u64,
    key_id: &str,
    dest_chain: &str,
    participants: Vec<Participant>,
) -> Event {
    let data = SignEventData {
        key_id: key_id.to_string(),
        tx_id: format!("tx-{event_id}"),
        utx_id: format!("utx-{event_id}"),
        message_hash: hex::encode([0x5a; 32]),
        destination_chain_id: dest_chain.to_string(),
        derivation_path: None,
        threshold: 2,
        participants,
    };
    Event::new(
        event_id,
        EventType::Sign,
        block,
        expiry,
        data.encode().unwrap(),
    )
}

pub fn key_event(
    event_id: &str,
    event_type: EventType,
    block: u64,
    expiry: u64,
    key_id: &str,
    participants: Vec<Participant>,
) -> Event {
    let data = KeyEventData {
        key_id: key_id.to_string(),
        process_id: format!("proc-{event_id}"),
        threshold: 2,
        participants,
        prev_key_id: None,
    };
    Event::new(event_id, event_type, block, expiry, data.encode().unwrap())
}

/// Poll the store until `event_id` reaches `status` or the deadline passes.
pub async fn wait_for_status(
    store: &EventStore,
    event_id: &str,
    status: EventStatus,
    deadline: Duration,
) {
    let start = std::time::Instant::now();
    loop {
        let current = store.get_event(event_id).unwrap().status;
        if current == status {
            return;
        }
        if start.elapsed() > deadline {
            panic!("event {event_id} stuck at {current}, wanted {status}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
