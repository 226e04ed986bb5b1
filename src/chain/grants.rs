// src/chain/grants.rs
//! Startup grant validation.
//!
//! The daemon only works if its hot key holds the required generic
//! authorizations from the configured granter. Anything missing is a fatal
//! startup error; better to refuse to start than to run a validator that
//! cannot vote.

use crate::chain::{GrantRecord, HomeChain};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};

/// Message types the daemon must be authorized to execute.
pub const REQUIRED_GRANTS: &[&str] = &[
    crate::chain::msgs::MSG_VOTE_INBOUND,
    crate::chain::msgs::MSG_VOTE_OUTBOUND,
    crate::chain::msgs::MSG_VOTE_GAS_PRICE,
    crate::chain::msgs::MSG_VOTE_TSS_KEY_PROCESS,
];

// The chain may still be indexing the grants right after they were issued;
// one short and one long retry before giving up.
const RETRY_DELAYS: &[Duration] = &[Duration::from_secs(15), Duration::from_secs(30)];

/// Filter `grants` down to the set of usable message types: unexpired,
/// from `granter`, generic authorizations only.
pub fn usable_message_types(grants: &[GrantRecord], granter: &str) -> HashSet<String> {
    let now = Utc::now();
    grants
        .iter()
        .filter(|g| g.granter == granter)
        .filter(|g| g.is_valid_at(now))
        .filter_map(|g| g.msg_type_url.clone())
        .collect()
}

/// Check `required` against `grants`; returns the missing message types.
pub fn missing_grants(
    grants: &[GrantRecord],
    granter: &str,
    required: &[&str],
) -> Vec<String> {
    let usable = usable_message_types(grants, granter);
    required
        .iter()
        .filter(|m| !usable.contains(**m))
        .map(|m| m.to_string())
        .collect()
}

/// Query the chain for the hot key's grants and fail unless every required
/// message type is covered. Retries the query on transient failure.
pub async fn validate_startup_grants(
    chain: &dyn HomeChain,
    grantee: &str,
    granter: &str,
    required: &[&str],
) -> Result<()> {
    let mut grants = None;
    for (i, delay) in std::iter::once(None)
        .chain(RETRY_DELAYS.iter().map(Some))
        .enumerate()
    {
        if let Some(delay) = delay {
            warn!(attempt = i, "grant query failed, retrying in {delay:?}");
            tokio::time::sleep(*delay).await;
        }
        match chain.grantee_grants(grantee).await {
            Ok(g) => {
                grants = Some(g);
                break;
            }
            Err(e) if i == RETRY_DELAYS.len() => {
                return Err(e.context("querying grantee grants"));
            }
            Err(e) => warn!("grant query error: {e:#}"),
        }
    }
    let grants = grants.context("querying grantee grants")?;

    let missing = missing_grants(&grants, granter, required);
    if !missing.is_empty() {
        bail!(
            "hot key {grantee} is missing required grants from {granter}: {}",
            missing.join(", ")
        );
    }
    info!(
        grantee,
        granter,
        grants = grants.len(),
        "all required authorization grants present"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn grant(granter: &str, msg: Option<&str>, expired: bool) -> GrantRecord {
        GrantRecord {
            granter: granter.into(),
            grantee: "pc1hotkey".into(),
            msg_type_url: msg.map(String::from),
            expiration: expired.then(|| Utc::now() - ChronoDuration::hours(1)),
        }
    }

    #[test]
    fn expired_and_foreign_grants_are_dropped() {
        let grants = vec![
            grant("pc1granter", Some("/uv.uexecutor.v1.MsgVoteInbound"), false),
            grant("pc1granter", Some("/uv.uexecutor.v1.MsgVoteGasPrice"), true),
            grant("pc1other", Some("/uv.uexecutor.v1.MsgVoteOutbound"), false),
            // Non-generic authorization never satisfies a requirement.
            grant("pc1granter", None, false),
        ];
        let usable = usable_message_types(&grants, "pc1granter");
        assert_eq!(usable.len(), 1);
        assert!(usable.contains("/uv.uexecutor.v1.MsgVoteInbound"));
    }

    #[test]
    fn missing_grants_are_reported_by_type() {
        let grants = vec![
            grant("pc1granter", Some(crate::chain::msgs::MSG_VOTE_INBOUND), false),
            grant("pc1granter", Some(crate::chain::msgs::MSG_VOTE_OUTBOUND), false),
        ];
        let missing = missing_grants(&grants, "pc1granter", REQUIRED_GRANTS);
        assert_eq!(
            missing,
            vec![
                crate::chain::msgs::MSG_VOTE_GAS_PRICE.to_string(),
                crate::chain::msgs::MSG_VOTE_TSS_KEY_PROCESS.to_string(),
            ]
        );
    }

    #[test]
    fn complete_grant_set_passes() {
        let grants: Vec<GrantRecord> = REQUIRED_GRANTS
            .iter()
            .map(|m| grant("pc1granter", Some(m), false))
            .collect();
        assert!(missing_grants(&grants, "pc1granter", REQUIRED_GRANTS).is_empty());
    }
}
