// src/chain/msgs.rs
//! Home-chain message payloads produced by this daemon.
//!
//! Every vote is wrapped exactly once in the delegated-execution envelope
//! ([`MsgExec`]) naming the hot key as executor; the inner message's `signer`
//! is the granter. Messages travel as `@type`-tagged JSON objects matching
//! the chain's registry.

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub const MSG_EXEC: &str = "/cosmos.authz.v1beta1.MsgExec";
pub const MSG_VOTE_INBOUND: &str = "/uv.uexecutor.v1.MsgVoteInbound";
pub const MSG_VOTE_OUTBOUND: &str = "/uv.uexecutor.v1.MsgVoteOutbound";
pub const MSG_VOTE_GAS_PRICE: &str = "/uv.uexecutor.v1.MsgVoteGasPrice";
pub const MSG_VOTE_TSS_KEY_PROCESS: &str = "/uv.uexecutor.v1.MsgVoteTssKeyProcess";

/// A registry-tagged message, the JSON analogue of a protobuf `Any`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyMsg {
    #[serde(rename = "@type")]
    pub type_url: String,
    #[serde(flatten)]
    pub value: serde_json::Value,
}

impl AnyMsg {
    pub fn pack<T: Serialize>(type_url: &str, msg: &T) -> Result<Self> {
        Ok(Self {
            type_url: type_url.to_string(),
            value: serde_json::to_value(msg)?,
        })
    }
}

/// Delegated-execution envelope: the grantee executes `msgs` under the
/// granter's authority. Nested envelopes are not supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgExec {
    pub grantee: String,
    pub msgs: Vec<AnyMsg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundTxType {
    Unspecified,
    Synthetic,
    FeeAbstraction,
}

/// Funds locked on a foreign chain, observed past its confirmation depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tx_hash: String,
    pub source_chain: String,
    pub sender: String,
    pub recipient: String,
    /// Base-unit amount as a decimal string; foreign amounts exceed u64.
    pub amount: String,
    pub asset_addr: String,
    pub log_index: u64,
    pub tx_type: InboundTxType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgVoteInbound {
    pub signer: String,
    pub inbound: Inbound,
}

/// What this validator observed about an outbound tx on the destination
/// chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundObservation {
    pub success: bool,
    pub block_height: u64,
    pub tx_hash: String,
    pub error_msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgVoteOutbound {
    pub signer: String,
    pub tx_id: String,
    pub utx_id: String,
    pub observation: OutboundObservation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgVoteGasPrice {
    pub signer: String,
    pub observed_chain_id: String,
    /// Gas price in the chain's base unit, decimal string.
    pub price: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgVoteTssKeyProcess {
    pub signer: String,
    /// Group public key, compressed SEC1, hex.
    pub tss_pubkey: String,
    pub key_id: String,
    pub process_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_msg_carries_type_tag_and_fields() {
        let msg = MsgVoteGasPrice {
            signer: "pc1granter".into(),
            observed_chain_id: "eip155:11155111".into(),
            price: "2000000000".into(),
            block_number: 42,
        };
        let any = AnyMsg::pack(MSG_VOTE_GAS_PRICE, &msg).unwrap();
        let json = serde_json::to_value(&any).unwrap();
        assert_eq!(json["@type"], MSG_VOTE_GAS_PRICE);
        assert_eq!(json["observed_chain_id"], "eip155:11155111");
        assert_eq!(json["block_number"], 42);
    }

    #[test]
    fn inbound_tx_type_uses_screaming_snake() {
        let json = serde_json::to_value(InboundTxType::FeeAbstraction).unwrap();
        assert_eq!(json, "FEE_ABSTRACTION");
    }

    #[test]
    fn exec_envelope_round_trips() {
        let vote = MsgVoteOutbound {
            signer: "pc1granter".into(),
            tx_id: "tx-9".into(),
            utx_id: "utx-9".into(),
            observation: OutboundObservation {
                success: true,
                block_height: 77,
                tx_hash: "0xabc".into(),
                error_msg: String::new(),
            },
        };
        let exec = MsgExec {
            grantee: "pc1hotkey".into(),
            msgs: vec![AnyMsg::pack(MSG_VOTE_OUTBOUND, &vote).unwrap()],
        };
        let bytes = serde_json::to_vec(&exec).unwrap();
        let back: MsgExec = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.grantee, "pc1hotkey");
        assert_eq!(back.msgs[0].type_url, MSG_VOTE_OUTBOUND);
    }
}
