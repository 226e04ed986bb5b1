// src/foreign.rs
//! Destination-chain seam.
//!
//! Foreign-chain RPC clients (EVM, SVM, ...) live outside this crate; the
//! daemon only consumes two narrow contracts: broadcast a signed tx and
//! verify a previously broadcast one by hash. Implementations are registered
//! per chain id at startup.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Status of a transaction found on a destination chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignTxStatus {
    Success,
    Failed,
}

/// What `verify_broadcasted_tx` learned about a hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxVerification {
    pub found: bool,
    pub confirmations: u64,
    pub status: Option<ForeignTxStatus>,
}

impl TxVerification {
    pub fn not_found() -> Self {
        Self { found: false, confirmations: 0, status: None }
    }
}

#[async_trait]
pub trait ForeignChain: Send + Sync {
    /// Send a signed transaction; returns the raw tx hash on that chain.
    async fn broadcast_signed_tx(&self, message_hash: &[u8], signature: &[u8]) -> Result<String>;

    /// Look a broadcast tx up by raw hash.
    async fn verify_broadcasted_tx(&self, raw_hash: &str) -> Result<TxVerification>;
}

/// Per-chain-id registry of foreign chain clients.
#[derive(Default, Clone)]
pub struct ForeignChainRegistry {
    chains: HashMap<String, Arc<dyn ForeignChain>>,
}

impl ForeignChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, chain_id: impl Into<String>, client: Arc<dyn ForeignChain>) {
        self.chains.insert(chain_id.into(), client);
    }

    pub fn get(&self, chain_id: &str) -> Result<Arc<dyn ForeignChain>> {
        self.chains
            .get(chain_id)
            .cloned()
            .ok_or_else(|| anyhow!("no foreign chain client registered for {chain_id}"))
    }
}
