// src/revert.rs
//! Periodic sweep over failed and expired events.
//!
//! Two queues: FAILED rows (the protocol ran, the aftermath did not) and
//! block-expired rows. The one correctness-critical rule lives in the
//! BROADCASTED branch: the destination chain is consulted first, and a tx
//! that actually succeeded there is never voted as failed. Anything
//! uncertain (RPC failure, tx not yet visible, unparsable hash) is retried
//! on a later tick instead of reverted.

use crate::caip;
use crate::chain::msgs::OutboundObservation;
use crate::chain::votes::VoteClient;
use crate::chain::HomeChain;
use crate::foreign::{ForeignChainRegistry, ForeignTxStatus};
use crate::store::{Event, EventStatus, EventStore};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const SWEEP_LIMIT: u32 = 100;

pub struct RevertHandler {
    store: Arc<EventStore>,
    votes: Arc<VoteClient>,
    foreign: ForeignChainRegistry,
    chain: Arc<dyn HomeChain>,
    interval: Duration,
    /// Terminal rows older than this many blocks are deleted.
    retention_blocks: u64,
}

impl RevertHandler {
    pub fn new(
        store: Arc<EventStore>,
        votes: Arc<VoteClient>,
        foreign: ForeignChainRegistry,
        chain: Arc<dyn HomeChain>,
        interval: Duration,
        retention_blocks: u64,
    ) -> Self {
        Self {
            store,
            votes,
            foreign,
            chain,
            interval,
            retention_blocks,
        }
    }

    /// Loop until shutdown, sweeping every `interval`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("revert handler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("revert sweep failed: {e:#}");
                    }
                }
            }
        }
    }

    /// One sweep over both queues plus the retention cleanup.
    pub async fn tick(&self) -> Result<()> {
        let height = self.chain.latest_block_height().await?;
        self.process_failed().await;
        self.process_block_expired(height).await;
        match self.store.purge_terminal_events(height, self.retention_blocks) {
            Ok(0) => {}
            Ok(n) => debug!(purged = n, "terminal events purged"),
            Err(e) => warn!("terminal purge failed: {e}"),
        }
        Ok(())
    }

    async fn process_failed(&self) {
        let failed = match self.store.get_failed_events(SWEEP_LIMIT) {
            Ok(events) => events,
            Err(e) => {
                warn!("failed-event query error: {e}");
                return;
            }
        };
        for event in failed {
            if let Err(e) = self.revert_failed(&event).await {
                warn!(event_id = %event.event_id, "failed-event revert postponed: {e:#}");
            }
        }
    }

    async fn revert_failed(&self, event: &Event) -> Result<()> {
        if event.event_type.is_key_event() {
            // Key ceremonies have no chain-side effect to counter-vote.
            self.store.update_status(&event.event_id, EventStatus::Reverted)?;
            info!(event_id = %event.event_id, "failed key event reverted");
            return Ok(());
        }
        let data = event.sign_data()?;
        self.votes
            .vote_outbound(
                &data.tx_id,
                &data.utx_id,
                OutboundObservation {
                    success: false,
                    block_height: event.block_height,
                    tx_hash: String::new(),
                    error_msg: format!("event {} failed during processing", event.event_id),
                },
            )
            .await?;
        self.store.update_status(&event.event_id, EventStatus::Reverted)?;
        info!(event_id = %event.event_id, "failure voted, event reverted");
        Ok(())
    }

    async fn process_block_expired(&self, height: u64) {
        let expired = match self.store.get_block_expired_events(height, SWEEP_LIMIT) {
            Ok(events) => events,
            Err(e) => {
                warn!("block-expired query error: {e}");
                return;
            }
        };
        for event in expired {
            if event.status == EventStatus::InProgress {
                // The session core owns IN_PROGRESS rows; its timeout will
                // fail and reset them.
                continue;
            }
            if let Err(e) = self.revert_expired(&event).await {
                warn!(event_id = %event.event_id, "expired-event revert postponed: {e:#}");
            }
        }
    }

    async fn revert_expired(&self, event: &Event) -> Result<()> {
        if event.event_type.is_key_event() {
            self.store.update_status(&event.event_id, EventStatus::Reverted)?;
            info!(event_id = %event.event_id, "expired key event reverted");
            return Ok(());
        }

        if event.status != EventStatus::Broadcasted {
            // Never made it to the destination chain; safe to vote failure.
            let data = event.sign_data()?;
            self.votes
                .vote_outbound(
                    &data.tx_id,
                    &data.utx_id,
                    OutboundObservation {
                        success: false,
                        block_height: event.block_height,
                        tx_hash: String::new(),
                        error_msg: format!(
                            "event {} expired at block height {}",
                            event.event_id, event.expiry_block_height
                        ),
                    },
                )
                .await?;
            self.store.update_status(&event.event_id, EventStatus::Reverted)?;
            info!(event_id = %event.event_id, "expired sign event reverted");
            return Ok(());
        }

        self.verify_then_decide(event).await
    }

    /// A broadcast exists on the destination chain. Voting failure for a tx
    /// that succeeded there would double-spend, so the chain is consulted
    /// first and every uncertain answer means "try again next tick".
    async fn verify_then_decide(&self, event: &Event) -> Result<()> {
        let (chain_id, raw_hash) = match caip::parse_tx_hash(&event.broadcasted_tx_hash) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(
                    event_id = %event.event_id,
                    hash = %event.broadcasted_tx_hash,
                    "unparsable broadcast hash, retrying next tick: {e}"
                );
                return Ok(());
            }
        };
        let client = match self.foreign.get(chain_id) {
            Ok(client) => client,
            Err(e) => {
                warn!(event_id = %event.event_id, "no verifier, retrying next tick: {e}");
                return Ok(());
            }
        };
        let verification = match client.verify_broadcasted_tx(raw_hash).await {
            Ok(v) => v,
            Err(e) => {
                warn!(event_id = %event.event_id, "verify failed, retrying next tick: {e:#}");
                return Ok(());
            }
        };

        if !verification.found {
            debug!(event_id = %event.event_id, "broadcast tx not yet visible, retrying next tick");
            return Ok(());
        }
        match verification.status {
            Some(ForeignTxStatus::Success) => {
                // The destination observer will vote success through the
                // normal pipeline; nothing to do here.
                info!(
                    event_id = %event.event_id,
                    tx = %raw_hash,
                    "succeeded on-chain, skipping"
                );
                Ok(())
            }
            Some(ForeignTxStatus::Failed) => {
                let data = event.sign_data()?;
                self.votes
                    .vote_outbound(
                        &data.tx_id,
                        &data.utx_id,
                        OutboundObservation {
                            success: false,
                            block_height: event.block_height,
                            tx_hash: raw_hash.to_string(),
                            error_msg: format!("tx {raw_hash} failed on {chain_id}"),
                        },
                    )
                    .await?;
                self.store.update_status(&event.event_id, EventStatus::Reverted)?;
                info!(event_id = %event.event_id, "failed on-chain, failure voted and reverted");
                Ok(())
            }
            None => {
                debug!(event_id = %event.event_id, "tx found without status, retrying next tick");
                Ok(())
            }
        }
    }
}
