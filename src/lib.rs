// src/lib.rs
//! Universal validator daemon.
//!
//! Runs beside a home-chain consensus validator and does three jobs: drives
//! threshold-signing sessions across the validator set, votes cross-chain
//! observations to the home chain under delegated authority, and walks every
//! observed event through a durable state machine with crash recovery and
//! revert handling.

pub mod caip;
pub mod chain;
pub mod config;
pub mod foreign;
pub mod keyring;
pub mod keyshare;
pub mod node;
pub mod revert;
pub mod store;
pub mod transport;
pub mod tss;

use crate::chain::grants::{validate_startup_grants, REQUIRED_GRANTS};
use crate::chain::signer::TxSigner;
use crate::chain::votes::VoteClient;
use crate::chain::{HomeChain, HttpHomeChain};
use crate::config::Config;
use crate::foreign::ForeignChainRegistry;
use crate::keyring::Keyring;
use crate::keyshare::KeyshareStore;
use crate::node::{CoordinatorConfig, NodeCoordinator};
use crate::revert::RevertHandler;
use crate::store::EventStore;
use crate::transport::{Identity, Transport};
use crate::tss::engine::ProtocolEngine;
use crate::tss::{SessionCore, TssConfig};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Wire everything and run until a shutdown signal.
///
/// The protocol engine and the foreign-chain clients are injected: both are
/// external collaborators behind traits, and the caller decides what backs
/// them.
pub async fn run_daemon(
    cfg: Config,
    engine: Arc<dyn ProtocolEngine>,
    foreign: ForeignChainRegistry,
) -> Result<()> {
    let validation = cfg.validate();
    validation.log_summary();
    if !validation.valid {
        bail!("configuration invalid; refusing to start");
    }

    // Keyring and hot key.
    let keyring = Keyring::open(
        &cfg.node_home,
        cfg.keyring_backend,
        cfg.keyring_password.clone(),
    )?;
    let hot_key = keyring.hot_key(cfg.authz_hotkey_name.as_deref())?;
    info!(hot_key = %hot_key.address, granter = %cfg.authz_granter, "hot key loaded");

    // Home chain and startup grant check; missing grants are fatal.
    let home_chain: Arc<dyn HomeChain> = Arc::new(HttpHomeChain::new(&cfg.rpc_endpoint)?);
    validate_startup_grants(
        home_chain.as_ref(),
        &hot_key.address,
        &cfg.authz_granter,
        REQUIRED_GRANTS,
    )
    .await?;

    // Durable state.
    let store = Arc::new(EventStore::open(&cfg.event_db_path())?);
    let keyshares = Arc::new(KeyshareStore::open(
        &cfg.node_home,
        cfg.keyring_password.clone().unwrap_or_default(),
    )?);

    // Transport identity: configured seed, or ephemeral with a warning.
    let identity = match &cfg.p2p_private_key_hex {
        Some(seed) => Identity::from_seed_hex(seed)?,
        None => {
            let id = Identity::generate();
            warn!(peer_id = %id.peer_id(), "running with an ephemeral p2p identity");
            id
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let transport = Transport::start(
        &cfg.p2p_listen_addr,
        &cfg.p2p_protocol_id,
        identity,
        shutdown_rx.clone(),
    )
    .await?;

    // Session core; the local party id is the validator account this daemon
    // serves, which is how participants are named in event payloads.
    let mut tss_cfg = TssConfig::new(cfg.authz_granter.clone());
    tss_cfg.setup_grace = cfg.setup_grace();
    tss_cfg.setup_timeout = cfg.setup_timeout();
    tss_cfg.message_timeout = cfg.message_timeout();
    let sessions = SessionCore::new(
        tss_cfg,
        engine,
        transport.clone(),
        keyshares.clone(),
        store.clone(),
    );
    sessions.clone().attach_transport();

    // Delegated signing and votes.
    let signer = Arc::new(TxSigner::new(
        home_chain.clone(),
        hot_key,
        cfg.authz_granter.clone(),
        cfg.chain_id.clone(),
    ));
    let votes = Arc::new(VoteClient::new(signer));

    // Background loops.
    let revert = Arc::new(RevertHandler::new(
        store.clone(),
        votes.clone(),
        foreign.clone(),
        home_chain.clone(),
        cfg.revert_check_interval(),
        cfg.event_retention_blocks,
    ));
    let revert_task = tokio::spawn(revert.run(shutdown_rx.clone()));

    let coordinator = NodeCoordinator::new(
        CoordinatorConfig {
            poll_interval: cfg.poll_interval(),
            processing_timeout: cfg.processing_timeout(),
            pickup_limit: cfg.coordinator_range_size,
            min_confirmations: cfg.min_confirmations,
        },
        store,
        sessions,
        votes,
        home_chain,
        foreign,
    );
    let coordinator_task = tokio::spawn(coordinator.run(shutdown_rx));

    info!("universal validator daemon started");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = revert_task.await;
    coordinator_task.await.context("coordinator task")??;
    info!("daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
