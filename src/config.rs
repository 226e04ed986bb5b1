// src/config.rs
// Daemon configuration: TOML file under node_home, environment overrides,
// and a startup validation sweep.

use crate::keyring::KeyringBackend;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Daemon home: keyring, keyshares, event database, config file.
    pub node_home: PathBuf,
    pub keyring_backend: KeyringBackend,
    /// Required for the `file` backend. Never written to the config file;
    /// comes from UV_KEYRING_PASSWORD or an interactive prompt.
    #[serde(skip_serializing)]
    pub keyring_password: Option<String>,
    /// Name of the hot key inside the keyring; first key when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authz_hotkey_name: Option<String>,

    pub chain_id: String,
    /// Home-chain endpoint; the scheme picks plaintext or TLS.
    pub rpc_endpoint: String,
    /// Account that granted vote authority to the hot key (bech32).
    pub authz_granter: String,

    pub poll_interval_secs: u64,
    pub processing_timeout_secs: u64,
    /// Confirmed-event pickup bound per poll tick.
    pub coordinator_range_size: u32,
    pub min_confirmations: u64,

    pub setup_grace_secs: u64,
    pub setup_timeout_secs: u64,
    pub message_timeout_secs: u64,
    pub revert_check_interval_secs: u64,
    /// Terminal rows are purged once this many blocks behind the tip.
    pub event_retention_blocks: u64,

    pub p2p_listen_addr: String,
    /// 32-byte Ed25519 seed, hex. Never written back to the config file.
    #[serde(skip_serializing)]
    pub p2p_private_key_hex: Option<String>,
    pub p2p_protocol_id: String,
}

impl Default for Config {
    fn default() -> Self {
        let node_home = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".uv-node");
        Self {
            node_home,
            keyring_backend: KeyringBackend::File,
            keyring_password: None,
            authz_hotkey_name: None,
            chain_id: "uv_9000-1".to_string(),
            rpc_endpoint: "http://localhost:1317".to_string(),
            authz_granter: String::new(),
            poll_interval_secs: 2,
            processing_timeout_secs: 300,
            coordinator_range_size: 100,
            min_confirmations: 0,
            setup_grace_secs: 5,
            setup_timeout_secs: 30,
            message_timeout_secs: 30,
            revert_check_interval_secs: 30,
            event_retention_blocks: 10_000,
            p2p_listen_addr: "0.0.0.0:26700".to_string(),
            p2p_private_key_hex: None,
            p2p_protocol_id: "uv/tss/1.0.0".to_string(),
        }
    }
}

impl Config {
    /// Load from `<home>/config.toml` if present, then apply environment
    /// overrides for the secret-bearing options.
    pub fn load(home_override: Option<&Path>) -> Result<Self> {
        let mut cfg = Config::default();
        if let Some(home) = home_override {
            cfg.node_home = home.to_path_buf();
        }
        let path = cfg.node_home.join(CONFIG_FILE);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            cfg = toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
            if let Some(home) = home_override {
                cfg.node_home = home.to_path_buf();
            }
        }
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("UV_KEYRING_PASSWORD") {
            if !v.is_empty() {
                self.keyring_password = Some(v);
            }
        }
        if let Ok(v) = std::env::var("UV_P2P_PRIVATE_KEY_HEX") {
            if !v.is_empty() {
                self.p2p_private_key_hex = Some(v);
            }
        }
        if let Ok(v) = std::env::var("UV_RPC_ENDPOINT") {
            if !v.is_empty() {
                self.rpc_endpoint = v;
            }
        }
    }

    /// Write the current values as the config file (used by `config init`).
    pub fn save(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.node_home)
            .with_context(|| format!("creating {}", self.node_home.display()))?;
        let path = self.node_home.join(CONFIG_FILE);
        let body = toml::to_string_pretty(self).context("encoding config")?;
        std::fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }
    pub fn setup_grace(&self) -> Duration {
        Duration::from_secs(self.setup_grace_secs)
    }
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }
    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }
    pub fn revert_check_interval(&self) -> Duration {
        Duration::from_secs(self.revert_check_interval_secs)
    }

    pub fn event_db_path(&self) -> PathBuf {
        self.node_home.join("events.db")
    }

    /// Startup sweep: collect everything wrong or suspicious before the
    /// daemon commits to starting.
    pub fn validate(&self) -> ConfigValidation {
        let mut v = ConfigValidation::new();

        if self.chain_id.is_empty() {
            v.add_error("chain_id is empty".into());
        }
        if !self.rpc_endpoint.starts_with("http://") && !self.rpc_endpoint.starts_with("https://") {
            v.add_error(format!(
                "rpc_endpoint must start with http:// or https:// (got {:?})",
                self.rpc_endpoint
            ));
        }
        if self.authz_granter.is_empty() {
            v.add_error("authz_granter is not set".into());
        } else if !self.authz_granter.starts_with(crate::keyring::ADDRESS_HRP) {
            v.add_error(format!(
                "authz_granter {:?} does not look like a {}-prefixed bech32 address",
                self.authz_granter,
                crate::keyring::ADDRESS_HRP
            ));
        }
        if self.keyring_backend == KeyringBackend::File
            && self.keyring_password.as_deref().unwrap_or("").is_empty()
        {
            v.add_error(
                "keyring_backend 'file' requires keyring_password (UV_KEYRING_PASSWORD)".into(),
            );
        }
        if self.keyring_backend == KeyringBackend::Test {
            v.add_warning("keyring_backend 'test' stores keys unencrypted".into());
        }
        if self.p2p_listen_addr.parse::<std::net::SocketAddr>().is_err() {
            v.add_error(format!(
                "p2p_listen_addr {:?} is not host:port",
                self.p2p_listen_addr
            ));
        }
        match &self.p2p_private_key_hex {
            Some(hex_seed) => {
                let decoded = hex::decode(hex_seed.trim());
                if !matches!(decoded, Ok(ref b) if b.len() == 32) {
                    v.add_error("p2p_private_key_hex must be 64 hex chars (32-byte seed)".into());
                }
            }
            None => v.add_warning(
                "p2p_private_key_hex not set; the node will use an ephemeral p2p identity".into(),
            ),
        }
        if self.poll_interval_secs == 0 {
            v.add_warning("poll_interval of 0 busy-loops the event store".into());
        }
        if self.coordinator_range_size == 0 {
            v.add_warning("coordinator_range_size of 0 disables the pickup bound".into());
        }

        v
    }
}

/// Validation result for configuration checks.
pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        Self {
            valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn log_summary(&self) {
        for w in &self.warnings {
            warn!("config: {w}");
        }
        for e in &self.errors {
            error!("config: {e}");
        }
        if self.valid && self.warnings.is_empty() {
            info!("configuration validation passed");
        }
    }
}
