// src/keyshare.rs
//! Encrypted, per-key-id storage for threshold keyshares.
//!
//! One file per `key_id` under `node_home/keyshares`, sealed with the keyring
//! password. A share is written at most once: refreshed keys get a new
//! `key_id`, so an existing file always means operator error or a replayed
//! ceremony, and the write is refused.

use crate::keyring::{open_sealed, seal, SealedBlob};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyshareError {
    #[error("keyshare for {0} already exists")]
    AlreadyExists(String),
    #[error("keyshare for {0} not found")]
    NotFound(String),
    #[error("keyshare file for {key_id}: {source}")]
    Io {
        key_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("keyshare file for {0} is corrupt")]
    Corrupt(String),
    #[error("keyshare for {0}: {1}")]
    Crypto(String, String),
}

#[derive(Debug, Serialize, Deserialize)]
struct ShareFile {
    version: u32,
    key_id: String,
    /// Group public key, compressed SEC1, hex.
    public_key: String,
    sealed: SealedBlob,
    created_at: String,
}

/// The share and its group public key as read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyshare {
    pub key_id: String,
    pub public_key: Vec<u8>,
    pub share: Vec<u8>,
}

pub struct KeyshareStore {
    dir: PathBuf,
    password: String,
}

impl KeyshareStore {
    pub fn open(node_home: &Path, password: impl Into<String>) -> Result<Self, KeyshareError> {
        let dir = node_home.join("keyshares");
        fs::create_dir_all(&dir).map_err(|source| KeyshareError::Io {
            key_id: String::new(),
            source,
        })?;
        Ok(Self { dir, password: password.into() })
    }

    /// Persist a new share. Fails if the key id already has one.
    pub fn save(
        &self,
        key_id: &str,
        public_key: &[u8],
        share: &[u8],
    ) -> Result<(), KeyshareError> {
        let path = self.share_path(key_id);
        if path.exists() {
            return Err(KeyshareError::AlreadyExists(key_id.to_string()));
        }
        let sealed = seal(share, &self.password)
            .map_err(|e| KeyshareError::Crypto(key_id.to_string(), e.to_string()))?;
        let record = ShareFile {
            version: 1,
            key_id: key_id.to_string(),
            public_key: hex::encode(public_key),
            sealed,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let body = serde_json::to_string_pretty(&record)
            .map_err(|_| KeyshareError::Corrupt(key_id.to_string()))?;
        fs::write(&path, body).map_err(|source| KeyshareError::Io {
            key_id: key_id.to_string(),
            source,
        })
    }

    /// Read a share back. Fails when the key id is unknown.
    pub fn load(&self, key_id: &str) -> Result<Keyshare, KeyshareError> {
        let path = self.share_path(key_id);
        if !path.exists() {
            return Err(KeyshareError::NotFound(key_id.to_string()));
        }
        let raw = fs::read_to_string(&path).map_err(|source| KeyshareError::Io {
            key_id: key_id.to_string(),
            source,
        })?;
        let record: ShareFile =
            serde_json::from_str(&raw).map_err(|_| KeyshareError::Corrupt(key_id.to_string()))?;
        let share = open_sealed(&record.sealed, &self.password)
            .map_err(|e| KeyshareError::Crypto(key_id.to_string(), e.to_string()))?;
        let public_key =
            hex::decode(&record.public_key).map_err(|_| KeyshareError::Corrupt(key_id.to_string()))?;
        Ok(Keyshare {
            key_id: record.key_id,
            public_key,
            share,
        })
    }

    pub fn exists(&self, key_id: &str) -> bool {
        self.share_path(key_id).exists()
    }

    // Key ids can contain path separators and colons; hex keeps file names
    // safe on every platform.
    fn share_path(&self, key_id: &str) -> PathBuf {
        self.dir.join(format!("{}.share", hex::encode(key_id)))
    }
}
