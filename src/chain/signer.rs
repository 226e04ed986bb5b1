// src/chain/signer.rs
//! Delegated-authority transaction signing and broadcast.
//!
//! One signer owns one hot key and one sequence cache. The mutex keeps a
//! single transaction in flight per signer; the three-case sequence
//! reconciliation keeps the cache on the narrow path between reusing a
//! sequence (double-spend) and falling behind the chain (stuck forever).

use crate::chain::msgs::{AnyMsg, MsgExec, MSG_EXEC};
use crate::chain::{HomeChain, TxResponse};
use crate::keyring::HotKey;
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Substring the chain uses to report a stale sequence.
const SEQUENCE_MISMATCH: &str = "account sequence mismatch";
const MAX_BROADCAST_ATTEMPTS: u32 = 3;

pub const DEFAULT_GAS_LIMIT: u64 = 500_000_000;
pub const DEFAULT_FEE_AMOUNT: u128 = 500_000_000_000_000;
pub const FEE_DENOM: &str = "upc";
pub const DEFAULT_BROADCAST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fee {
    pub amount: Vec<Coin>,
    pub gas_limit: u64,
}

impl Default for Fee {
    fn default() -> Self {
        Self {
            amount: vec![Coin {
                denom: FEE_DENOM.to_string(),
                amount: DEFAULT_FEE_AMOUNT.to_string(),
            }],
            gas_limit: DEFAULT_GAS_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TxBody {
    messages: Vec<AnyMsg>,
    memo: String,
}

/// The canonical bytes the hot key signs over.
#[derive(Debug, Clone, Serialize)]
struct SignDoc<'a> {
    chain_id: &'a str,
    account_number: u64,
    sequence: u64,
    fee: &'a Fee,
    body: &'a TxBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthInfo {
    /// Compressed secp256k1 public key, hex.
    public_key: String,
    sequence: u64,
    fee: Fee,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedTx {
    body: TxBody,
    auth_info: AuthInfo,
    /// ECDSA signature, base64.
    signature: String,
}

struct SequenceState {
    /// Next sequence to use; 0 means unknown, re-read from chain.
    last_sequence: u64,
}

pub struct TxSigner {
    chain: Arc<dyn HomeChain>,
    hot_key: HotKey,
    /// Account whose authority (and sequence) the envelope runs under.
    granter: String,
    chain_id: String,
    state: Mutex<SequenceState>,
}

impl TxSigner {
    pub fn new(
        chain: Arc<dyn HomeChain>,
        hot_key: HotKey,
        granter: impl Into<String>,
        chain_id: impl Into<String>,
    ) -> Self {
        Self {
            chain,
            hot_key,
            granter: granter.into(),
            chain_id: chain_id.into(),
            state: Mutex::new(SequenceState { last_sequence: 0 }),
        }
    }

    pub fn grantee_address(&self) -> &str {
        &self.hot_key.address
    }

    pub fn granter_address(&self) -> &str {
        &self.granter
    }

    /// Wrap `msgs` in the delegated-execution envelope, sign with sequence
    /// management, broadcast in sync mode, and retry a bounded number of
    /// times on sequence mismatch. The whole path is bounded by `timeout`.
    pub async fn broadcast_as_grantee(
        &self,
        msgs: Vec<AnyMsg>,
        memo: &str,
        fee: Fee,
        timeout: Duration,
    ) -> Result<TxResponse> {
        tokio::time::timeout(timeout, self.broadcast_locked(msgs, memo, fee))
            .await
            .map_err(|_| anyhow!("broadcast timed out after {timeout:?} (memo: {memo})"))?
    }

    async fn broadcast_locked(&self, msgs: Vec<AnyMsg>, memo: &str, fee: Fee) -> Result<TxResponse> {
        let exec = MsgExec {
            grantee: self.hot_key.address.clone(),
            msgs,
        };
        let body = TxBody {
            messages: vec![AnyMsg::pack(MSG_EXEC, &exec)?],
            memo: memo.to_string(),
        };

        // One tx in flight per signer: the lock spans refresh, sign,
        // broadcast and the cache update.
        let mut state = self.state.lock().await;

        for attempt in 1..=MAX_BROADCAST_ATTEMPTS {
            let account = self
                .chain
                .account(&self.granter)
                .await
                .context("refreshing account sequence")?;

            // Three-case reconciliation: unknown adopts the chain, behind
            // adopts the chain, ahead keeps local (our txs may not have
            // indexed yet).
            if state.last_sequence == 0 || account.sequence > state.last_sequence {
                state.last_sequence = account.sequence;
            }
            let sequence = state.last_sequence;

            let tx_bytes = self.sign_tx(&body, &fee, account.account_number, sequence)?;
            debug!(memo, sequence, attempt, "broadcasting tx");

            match self.chain.broadcast_tx_sync(tx_bytes).await {
                Ok(resp) if resp.is_ok() => {
                    state.last_sequence = sequence + 1;
                    return Ok(resp);
                }
                Ok(resp) if resp.raw_log.contains(SEQUENCE_MISMATCH) => {
                    warn!(memo, sequence, attempt, "sequence mismatch, resetting cache");
                    state.last_sequence = 0;
                    if attempt == MAX_BROADCAST_ATTEMPTS {
                        bail!(
                            "broadcast failed after {MAX_BROADCAST_ATTEMPTS} attempts: {}",
                            resp.raw_log
                        );
                    }
                }
                Ok(resp) => {
                    // The tx may still have consumed the sequence; burning
                    // one number is recoverable, reusing one is not.
                    state.last_sequence = sequence + 1;
                    bail!("broadcast rejected with code {}: {}", resp.code, resp.raw_log);
                }
                Err(e) if e.to_string().contains(SEQUENCE_MISMATCH) => {
                    warn!(memo, sequence, attempt, "sequence mismatch, resetting cache");
                    state.last_sequence = 0;
                    if attempt == MAX_BROADCAST_ATTEMPTS {
                        return Err(e.context(format!(
                            "broadcast failed after {MAX_BROADCAST_ATTEMPTS} attempts"
                        )));
                    }
                }
                Err(e) => {
                    state.last_sequence = sequence + 1;
                    return Err(e.context("broadcast transport error"));
                }
            }
        }
        unreachable!("broadcast loop exits by return or bail")
    }

    fn sign_tx(&self, body: &TxBody, fee: &Fee, account_number: u64, sequence: u64) -> Result<Vec<u8>> {
        let sign_doc = SignDoc {
            chain_id: &self.chain_id,
            account_number,
            sequence,
            fee,
            body,
        };
        let digest = Sha256::digest(serde_json::to_vec(&sign_doc)?);
        let signature = self.hot_key.sign_prehash(&digest)?;
        let tx = SignedTx {
            body: body.clone(),
            auth_info: AuthInfo {
                public_key: hex::encode(self.hot_key.public_key_bytes()?),
                sequence,
                fee: fee.clone(),
            },
            signature: BASE64.encode(signature.to_bytes()),
        };
        Ok(serde_json::to_vec(&tx)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{AccountInfo, GrantRecord};
    use crate::keyring::{Keyring, KeyringBackend};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    /// Chain stub: tracks the on-chain sequence and scripts failures.
    struct ChainStub {
        state: SyncMutex<StubState>,
    }

    struct StubState {
        chain_sequence: u64,
        /// When set, the account query reports this instead of
        /// `chain_sequence` (simulates indexing lag).
        reported_sequence: Option<u64>,
        /// Sequences of accepted broadcasts, in order.
        accepted: Vec<u64>,
        /// Responses to force before accepting, newest last.
        scripted: Vec<ScriptedReply>,
    }

    enum ScriptedReply {
        Mismatch,
        RejectedCode(u32),
        TransportError(&'static str),
    }

    impl ChainStub {
        fn new(chain_sequence: u64) -> Self {
            Self {
                state: SyncMutex::new(StubState {
                    chain_sequence,
                    reported_sequence: None,
                    accepted: Vec::new(),
                    scripted: Vec::new(),
                }),
            }
        }

        fn script(&self, reply: ScriptedReply) {
            self.state.lock().scripted.push(reply);
        }

        fn accepted(&self) -> Vec<u64> {
            self.state.lock().accepted.clone()
        }
    }

    #[async_trait]
    impl HomeChain for ChainStub {
        async fn account(&self, _address: &str) -> Result<AccountInfo> {
            let state = self.state.lock();
            Ok(AccountInfo {
                account_number: 7,
                sequence: state.reported_sequence.unwrap_or(state.chain_sequence),
            })
        }

        async fn grantee_grants(&self, _grantee: &str) -> Result<Vec<GrantRecord>> {
            Ok(Vec::new())
        }

        async fn broadcast_tx_sync(&self, tx_bytes: Vec<u8>) -> Result<TxResponse> {
            let tx: serde_json::Value = serde_json::from_slice(&tx_bytes).unwrap();
            let sequence = tx["auth_info"]["sequence"].as_u64().unwrap();
            let mut state = self.state.lock();
            if !state.scripted.is_empty() {
                match state.scripted.remove(0) {
                    ScriptedReply::Mismatch => {
                        return Ok(TxResponse {
                            code: 32,
                            txhash: String::new(),
                            raw_log: format!("account sequence mismatch, expected {}", state.chain_sequence),
                        })
                    }
                    ScriptedReply::RejectedCode(code) => {
                        return Ok(TxResponse {
                            code,
                            txhash: String::new(),
                            raw_log: "out of gas".into(),
                        })
                    }
                    ScriptedReply::TransportError(msg) => bail!("{}", msg),
                }
            }
            if sequence != state.chain_sequence {
                return Ok(TxResponse {
                    code: 32,
                    txhash: String::new(),
                    raw_log: format!("account sequence mismatch, expected {}", state.chain_sequence),
                });
            }
            state.chain_sequence += 1;
            state.accepted.push(sequence);
            Ok(TxResponse {
                code: 0,
                txhash: format!("HASH{sequence}"),
                raw_log: String::new(),
            })
        }

        async fn latest_block_height(&self) -> Result<u64> {
            Ok(1)
        }
    }

    fn signer_with(chain: Arc<ChainStub>) -> TxSigner {
        let dir = tempfile::tempdir().unwrap();
        let ring = Keyring::open(dir.path(), KeyringBackend::Test, None).unwrap();
        let hot_key = ring.create_key("hotkey").unwrap();
        TxSigner::new(chain, hot_key, "pc1granter", "uv_9000-1")
    }

    fn any_vote() -> Vec<AnyMsg> {
        vec![AnyMsg::pack(
            crate::chain::msgs::MSG_VOTE_GAS_PRICE,
            &crate::chain::msgs::MsgVoteGasPrice {
                signer: "pc1granter".into(),
                observed_chain_id: "eip155:1".into(),
                price: "1".into(),
                block_number: 1,
            },
        )
        .unwrap()]
    }

    #[tokio::test]
    async fn sequences_are_strictly_consecutive_across_concurrent_votes() {
        let chain = Arc::new(ChainStub::new(17));
        let signer = Arc::new(signer_with(chain.clone()));

        let a = {
            let signer = signer.clone();
            tokio::spawn(async move {
                signer
                    .broadcast_as_grantee(any_vote(), "vote a", Fee::default(), DEFAULT_BROADCAST_TIMEOUT)
                    .await
            })
        };
        let b = {
            let signer = signer.clone();
            tokio::spawn(async move {
                signer
                    .broadcast_as_grantee(any_vote(), "vote b", Fee::default(), DEFAULT_BROADCAST_TIMEOUT)
                    .await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(chain.accepted(), vec![17, 18]);
    }

    #[tokio::test]
    async fn mismatch_then_recovery_within_attempts() {
        let chain = Arc::new(ChainStub::new(5));
        chain.script(ScriptedReply::Mismatch);
        chain.script(ScriptedReply::Mismatch);
        let signer = signer_with(chain.clone());
        // Attempts 1 and 2 hit mismatches, attempt 3 lands.
        signer
            .broadcast_as_grantee(any_vote(), "vote", Fee::default(), DEFAULT_BROADCAST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(chain.accepted(), vec![5]);
    }

    #[tokio::test]
    async fn mismatch_on_final_attempt_surfaces_error() {
        let chain = Arc::new(ChainStub::new(5));
        for _ in 0..3 {
            chain.script(ScriptedReply::Mismatch);
        }
        let signer = signer_with(chain.clone());
        let err = signer
            .broadcast_as_grantee(any_vote(), "vote", Fee::default(), DEFAULT_BROADCAST_TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("3 attempts"), "got: {err:#}");
        assert!(chain.accepted().is_empty());
    }

    #[tokio::test]
    async fn non_sequence_rejection_increments_and_surfaces() {
        let chain = Arc::new(ChainStub::new(9));
        chain.script(ScriptedReply::RejectedCode(11));
        let signer = signer_with(chain.clone());
        let err = signer
            .broadcast_as_grantee(any_vote(), "vote", Fee::default(), DEFAULT_BROADCAST_TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("code 11"), "got: {err:#}");

        // The cache burned sequence 9; the next broadcast starts at 10 and
        // reconciles down is impossible, so the stub must accept 10 once the
        // chain catches up.
        chain.state.lock().chain_sequence = 10;
        signer
            .broadcast_as_grantee(any_vote(), "vote", Fee::default(), DEFAULT_BROADCAST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(chain.accepted(), vec![10]);
    }

    #[tokio::test]
    async fn transport_error_with_mismatch_text_retries() {
        let chain = Arc::new(ChainStub::new(3));
        chain.script(ScriptedReply::TransportError(
            "rpc error: account sequence mismatch",
        ));
        let signer = signer_with(chain.clone());
        signer
            .broadcast_as_grantee(any_vote(), "vote", Fee::default(), DEFAULT_BROADCAST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(chain.accepted(), vec![3]);
    }

    #[tokio::test]
    async fn local_ahead_of_stale_chain_keeps_local() {
        let chain = Arc::new(ChainStub::new(4));
        let signer = signer_with(chain.clone());
        signer
            .broadcast_as_grantee(any_vote(), "vote", Fee::default(), DEFAULT_BROADCAST_TIMEOUT)
            .await
            .unwrap();
        // The first tx consumed 4 but has not indexed yet: the account query
        // still reports 4 while the mempool expects 5. Local cache (5) must
        // win over the stale report, or we would re-sign with 4.
        chain.state.lock().reported_sequence = Some(4);
        signer
            .broadcast_as_grantee(any_vote(), "vote", Fee::default(), DEFAULT_BROADCAST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(chain.accepted(), vec![4, 5]);
    }
}
