// src/chain/mod.rs
//! Home-chain access: account/grant queries, block height, tx broadcast.
//!
//! The daemon consumes four query/broadcast contracts. They are isolated
//! behind the [`HomeChain`] trait so the signer, grant validator and revert
//! handler can run against mocks; the real implementation talks to the
//! chain's HTTP gateway with `reqwest`, plaintext or TLS depending on the
//! configured URL scheme.

pub mod grants;
pub mod msgs;
pub mod signer;
pub mod votes;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Account state needed for sequence management.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub account_number: u64,
    pub sequence: u64,
}

/// One authorization grant as reported by the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRecord {
    pub granter: String,
    pub grantee: String,
    /// Inner message type of a generic authorization; `None` for other
    /// authorization kinds (those never satisfy a required grant).
    pub msg_type_url: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

impl GrantRecord {
    /// A grant is valid iff it has no expiration or the expiration is in the
    /// future.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map(|exp| exp > now).unwrap_or(true)
    }
}

/// Result of a sync-mode broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxResponse {
    pub code: u32,
    pub txhash: String,
    pub raw_log: String,
}

impl TxResponse {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

#[async_trait]
pub trait HomeChain: Send + Sync {
    async fn account(&self, address: &str) -> Result<AccountInfo>;
    async fn grantee_grants(&self, grantee: &str) -> Result<Vec<GrantRecord>>;
    async fn broadcast_tx_sync(&self, tx_bytes: Vec<u8>) -> Result<TxResponse>;
    async fn latest_block_height(&self) -> Result<u64>;
}

/// HTTP-gateway client. `base_url` must carry its scheme; that is how the
/// plaintext/TLS choice is expressed.
pub struct HttpHomeChain {
    http: reqwest::Client,
    base_url: String,
}

impl HttpHomeChain {
    pub fn new(base_url: &str) -> Result<Self> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            bail!("rpc_endpoint must start with http:// or https://, got {base_url:?}");
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("GET {url} returned {status}: {body}");
        }
        resp.json::<T>().await.with_context(|| format!("decoding {url}"))
    }
}

// Gateway payloads carry integers as JSON strings.
fn parse_u64(s: &str, what: &str) -> Result<u64> {
    s.parse::<u64>()
        .map_err(|_| anyhow!("invalid {what} from chain: {s:?}"))
}

#[derive(Deserialize)]
struct AccountResponse {
    account: AccountBody,
}

#[derive(Deserialize)]
struct AccountBody {
    #[serde(default)]
    account_number: String,
    #[serde(default)]
    sequence: String,
}

#[derive(Deserialize)]
struct GrantsResponse {
    #[serde(default)]
    grants: Vec<GrantBody>,
}

#[derive(Deserialize)]
struct GrantBody {
    #[serde(default)]
    granter: String,
    #[serde(default)]
    grantee: String,
    authorization: Option<AuthorizationBody>,
    expiration: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct AuthorizationBody {
    #[serde(rename = "@type", default)]
    type_url: String,
    #[serde(default)]
    msg: String,
}

#[derive(Deserialize)]
struct BroadcastResponse {
    tx_response: TxResponseBody,
}

#[derive(Deserialize)]
struct TxResponseBody {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    txhash: String,
    #[serde(default)]
    raw_log: String,
}

#[derive(Deserialize)]
struct LatestBlockResponse {
    block: BlockBody,
}

#[derive(Deserialize)]
struct BlockBody {
    header: HeaderBody,
}

#[derive(Deserialize)]
struct HeaderBody {
    height: String,
}

#[async_trait]
impl HomeChain for HttpHomeChain {
    async fn account(&self, address: &str) -> Result<AccountInfo> {
        let resp: AccountResponse = self
            .get_json(&format!("/cosmos/auth/v1beta1/accounts/{address}"))
            .await?;
        Ok(AccountInfo {
            account_number: parse_u64(&resp.account.account_number, "account number")?,
            sequence: parse_u64(&resp.account.sequence, "sequence")?,
        })
    }

    async fn grantee_grants(&self, grantee: &str) -> Result<Vec<GrantRecord>> {
        let resp: GrantsResponse = self
            .get_json(&format!("/cosmos/authz/v1beta1/grants/grantee/{grantee}"))
            .await?;
        Ok(resp
            .grants
            .into_iter()
            .map(|g| {
                let msg_type_url = g.authorization.as_ref().and_then(|a| {
                    a.type_url
                        .ends_with("GenericAuthorization")
                        .then(|| a.msg.clone())
                });
                GrantRecord {
                    granter: g.granter,
                    grantee: g.grantee,
                    msg_type_url,
                    expiration: g.expiration,
                }
            })
            .collect())
    }

    async fn broadcast_tx_sync(&self, tx_bytes: Vec<u8>) -> Result<TxResponse> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        let url = format!("{}/cosmos/tx/v1beta1/txs", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "tx_bytes": BASE64.encode(&tx_bytes),
                "mode": "BROADCAST_MODE_SYNC",
            }))
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("broadcast returned {status}: {body}");
        }
        let body: BroadcastResponse = resp.json().await.context("decoding broadcast response")?;
        Ok(TxResponse {
            code: body.tx_response.code,
            txhash: body.tx_response.txhash,
            raw_log: body.tx_response.raw_log,
        })
    }

    async fn latest_block_height(&self) -> Result<u64> {
        let resp: LatestBlockResponse = self
            .get_json("/cosmos/base/tendermint/v1beta1/blocks/latest")
            .await?;
        parse_u64(&resp.block.header.height, "block height")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_is_required() {
        assert!(HttpHomeChain::new("localhost:1317").is_err());
        assert!(HttpHomeChain::new("http://localhost:1317").is_ok());
        assert!(HttpHomeChain::new("https://rpc.example.com/").is_ok());
    }

    #[test]
    fn grant_validity_window() {
        let mut grant = GrantRecord {
            granter: "pc1granter".into(),
            grantee: "pc1grantee".into(),
            msg_type_url: Some("/uv.MsgVoteInbound".into()),
            expiration: None,
        };
        let now = Utc::now();
        assert!(grant.is_valid_at(now), "no expiration means valid");
        grant.expiration = Some(now + chrono::Duration::hours(1));
        assert!(grant.is_valid_at(now));
        grant.expiration = Some(now - chrono::Duration::seconds(1));
        assert!(!grant.is_valid_at(now));
    }
}
