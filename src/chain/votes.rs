// src/chain/votes.rs
//! Typed vote operations over the transaction signer.
//!
//! Each vote builds its domain message with the granter as signer, tags it
//! with a descriptive memo, and rides the delegated-execution path. A
//! non-zero on-chain code is already surfaced as an error by the signer.

use crate::chain::msgs::{
    AnyMsg, Inbound, MsgVoteGasPrice, MsgVoteInbound, MsgVoteOutbound, MsgVoteTssKeyProcess,
    OutboundObservation, MSG_VOTE_GAS_PRICE, MSG_VOTE_INBOUND, MSG_VOTE_OUTBOUND,
    MSG_VOTE_TSS_KEY_PROCESS,
};
use crate::chain::signer::{Fee, TxSigner, DEFAULT_BROADCAST_TIMEOUT};
use crate::chain::TxResponse;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct VoteClient {
    signer: Arc<TxSigner>,
    vote_timeout: Duration,
}

impl VoteClient {
    pub fn new(signer: Arc<TxSigner>) -> Self {
        Self {
            signer,
            vote_timeout: DEFAULT_BROADCAST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.vote_timeout = timeout;
        self
    }

    async fn vote(&self, msg: AnyMsg, memo: String) -> Result<TxResponse> {
        let resp = self
            .signer
            .broadcast_as_grantee(vec![msg], &memo, Fee::default(), self.vote_timeout)
            .await?;
        info!(memo, txhash = %resp.txhash, "vote broadcast accepted");
        Ok(resp)
    }

    /// Vote that funds were locked on a foreign chain.
    pub async fn vote_inbound(&self, inbound: Inbound) -> Result<TxResponse> {
        let memo = format!("Vote inbound: {}", inbound.tx_hash);
        let msg = MsgVoteInbound {
            signer: self.signer.granter_address().to_string(),
            inbound,
        };
        self.vote(AnyMsg::pack(MSG_VOTE_INBOUND, &msg)?, memo).await
    }

    /// Vote the observed result of an outbound tx on its destination chain.
    pub async fn vote_outbound(
        &self,
        tx_id: &str,
        utx_id: &str,
        observation: OutboundObservation,
    ) -> Result<TxResponse> {
        let memo = format!("Vote outbound: {tx_id}");
        let msg = MsgVoteOutbound {
            signer: self.signer.granter_address().to_string(),
            tx_id: tx_id.to_string(),
            utx_id: utx_id.to_string(),
            observation,
        };
        self.vote(AnyMsg::pack(MSG_VOTE_OUTBOUND, &msg)?, memo).await
    }

    /// Vote a gas-price observation for a foreign chain.
    pub async fn vote_gas_price(
        &self,
        observed_chain_id: &str,
        price: &str,
        block_number: u64,
    ) -> Result<TxResponse> {
        let memo = format!("Vote gas price: {observed_chain_id} @ {price}");
        let msg = MsgVoteGasPrice {
            signer: self.signer.granter_address().to_string(),
            observed_chain_id: observed_chain_id.to_string(),
            price: price.to_string(),
            block_number,
        };
        self.vote(AnyMsg::pack(MSG_VOTE_GAS_PRICE, &msg)?, memo).await
    }

    /// Vote the outcome of a TSS key ceremony.
    pub async fn vote_tss_key_process(
        &self,
        tss_pubkey: &str,
        key_id: &str,
        process_id: &str,
    ) -> Result<TxResponse> {
        let memo = format!("Vote TSS key: {key_id}");
        let msg = MsgVoteTssKeyProcess {
            signer: self.signer.granter_address().to_string(),
            tss_pubkey: tss_pubkey.to_string(),
            key_id: key_id.to_string(),
            process_id: process_id.to_string(),
        };
        self.vote(AnyMsg::pack(MSG_VOTE_TSS_KEY_PROCESS, &msg)?, memo)
            .await
    }
}
