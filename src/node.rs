// src/node.rs
//! The node coordinator: polls the event store, claims confirmed events,
//! and drives each one through its pipeline stage.
//!
//! Startup resets IN_PROGRESS leftovers from a crash back to CONFIRMED.
//! Every tick: expired CONFIRMED rows are marked EXPIRED, then up to
//! `pickup_limit` eligible rows are claimed (moved to IN_PROGRESS) and
//! handed to per-event tasks bounded by `processing_timeout`.

use crate::caip;
use crate::chain::votes::VoteClient;
use crate::chain::HomeChain;
use crate::foreign::ForeignChainRegistry;
use crate::store::{Event, EventStatus, EventStore, EventType};
use crate::tss::SessionCore;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    /// Deadline for one event's whole processing task.
    pub processing_timeout: Duration,
    /// CONFIRMED rows claimed per tick; bounds task spawning.
    pub pickup_limit: u32,
    /// Home-chain blocks an event must age before pickup.
    pub min_confirmations: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            processing_timeout: Duration::from_secs(300),
            pickup_limit: 100,
            min_confirmations: 0,
        }
    }
}

pub struct NodeCoordinator {
    cfg: CoordinatorConfig,
    store: Arc<EventStore>,
    sessions: Arc<SessionCore>,
    votes: Arc<VoteClient>,
    chain: Arc<dyn HomeChain>,
    foreign: ForeignChainRegistry,
}

impl NodeCoordinator {
    pub fn new(
        cfg: CoordinatorConfig,
        store: Arc<EventStore>,
        sessions: Arc<SessionCore>,
        votes: Arc<VoteClient>,
        chain: Arc<dyn HomeChain>,
        foreign: ForeignChainRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            store,
            sessions,
            votes,
            chain,
            foreign,
        })
    }

    /// Poll loop. Runs until shutdown; aborts all in-flight event tasks on
    /// the way out.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let reset = self
            .store
            .reset_in_progress_to_confirmed()
            .context("startup reset of in-progress events")?;
        if reset > 0 {
            info!(reset, "recovered in-progress events back to confirmed");
        }

        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("node coordinator shutting down, aborting event tasks");
                    tasks.abort_all();
                    break;
                }
                _ = ticker.tick() => {
                    // Reap finished tasks so the set stays small.
                    while tasks.try_join_next().is_some() {}
                    if let Err(e) = Self::tick(&self, &mut tasks).await {
                        warn!("poll tick failed: {e:#}");
                    }
                }
            }
        }
        Ok(())
    }

    async fn tick(this: &Arc<Self>, tasks: &mut JoinSet<()>) -> Result<()> {
        let height = this
            .chain
            .latest_block_height()
            .await
            .context("querying latest block height")?;

        this.expire_confirmed(height);

        // Pipeline width: rows already in flight count against the pickup
        // bound, so a slow batch cannot pile tasks up. A limit of 0 leaves
        // pickup unbounded.
        let limit = if this.cfg.pickup_limit == 0 {
            0
        } else {
            let in_flight = this.store.count_in_progress()?;
            let budget = (this.cfg.pickup_limit as u64).saturating_sub(in_flight);
            if budget == 0 {
                debug!(in_flight, "pipeline full, skipping pickup this tick");
                return Ok(());
            }
            budget as u32
        };

        let eligible =
            this.store
                .get_non_expired_confirmed(height, this.cfg.min_confirmations, limit)?;
        if !eligible.is_empty() {
            debug!(count = eligible.len(), height, "claiming confirmed events");
        }
        for event in eligible {
            // Claim before spawning so the next tick cannot double-pick.
            if let Err(e) = this.store.update_status(&event.event_id, EventStatus::InProgress) {
                warn!(event_id = %event.event_id, "claim failed: {e}");
                continue;
            }
            let task_self = this.clone();
            tasks.spawn(async move {
                let deadline = task_self.cfg.processing_timeout;
                match tokio::time::timeout(deadline, task_self.process_event(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => task_self.fail_event(&event, &format!("{e:#}")),
                    Err(_) => {
                        task_self.fail_event(&event, &format!("processing exceeded {deadline:?}"))
                    }
                }
            });
        }
        Ok(())
    }

    /// CONFIRMED rows whose expiry passed are parked as EXPIRED; the revert
    /// handler may race us to them and vote failure instead, both outcomes
    /// are legal.
    fn expire_confirmed(&self, height: u64) {
        let expired = match self.store.get_expired_confirmed(height, self.cfg.pickup_limit) {
            Ok(events) => events,
            Err(e) => {
                warn!("expired-confirmed query failed: {e}");
                return;
            }
        };
        for event in expired {
            match self.store.update_status(&event.event_id, EventStatus::Expired) {
                Ok(()) => info!(event_id = %event.event_id, "confirmed event expired unpicked"),
                Err(e) => debug!(event_id = %event.event_id, "expiry transition lost: {e}"),
            }
        }
    }

    async fn process_event(&self, event: &Event) -> Result<()> {
        match event.event_type {
            EventType::Sign => self.process_sign(event).await,
            _ => self.process_key_ceremony(event).await,
        }
    }

    async fn process_key_ceremony(&self, event: &Event) -> Result<()> {
        let data = event.key_data()?;
        let outcome = self
            .sessions
            .run_key_ceremony(event)
            .await
            .context("key ceremony")?;
        self.votes
            .vote_tss_key_process(
                &hex::encode(&outcome.public_key),
                &outcome.key_id,
                &data.process_id,
            )
            .await
            .context("voting tss key process")?;
        self.store
            .update_status(&event.event_id, EventStatus::Completed)?;
        info!(
            event_id = %event.event_id,
            key_id = %outcome.key_id,
            "key ceremony completed and voted"
        );
        Ok(())
    }

    async fn process_sign(&self, event: &Event) -> Result<()> {
        let data = event.sign_data()?;
        let signature = self.sessions.run_sign(event).await.context("sign session")?;
        self.store
            .update_status(&event.event_id, EventStatus::Signed)?;

        let client = self.foreign.get(&data.destination_chain_id)?;
        let message_hash = hex::decode(&data.message_hash).context("message hash is not hex")?;
        let raw_hash = client
            .broadcast_signed_tx(&message_hash, &signature)
            .await
            .context("destination broadcast")?;

        let caip_hash = caip::format_tx_hash(&data.destination_chain_id, &raw_hash);
        self.store
            .update_broadcasted_tx_hash(&event.event_id, &caip_hash)?;
        self.store
            .update_status(&event.event_id, EventStatus::Broadcasted)?;
        info!(
            event_id = %event.event_id,
            tx = %caip_hash,
            "outbound broadcast on destination chain"
        );
        // From here the destination observer votes the outcome through the
        // normal pipeline; stragglers fall to the revert handler.
        Ok(())
    }

    fn fail_event(&self, event: &Event, reason: &str) {
        warn!(event_id = %event.event_id, reason, "event processing failed");
        if let Err(e) = self.store.update_status(&event.event_id, EventStatus::Failed) {
            // Already moved by a competing sweep; FAILED would be illegal now.
            error!(event_id = %event.event_id, "could not mark event failed: {e}");
        }
    }
}
