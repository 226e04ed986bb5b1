// src/keyring.rs
//! Hot-key management.
//!
//! The daemon signs home-chain transactions with a secp256k1 hot key held in
//! a small file-backed keyring under `node_home`. The `file` backend encrypts
//! key files with AES-256-GCM under a PBKDF2-derived key; the `test` backend
//! stores them in the clear and exists for tests and local development only.

use anyhow::{anyhow, bail, Context, Result};
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

// Encryption imports
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use pbkdf2::pbkdf2_hmac;

const PBKDF2_ITERATIONS: u32 = 600_000; // OWASP recommended minimum
const SALT_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;

/// Bech32 human-readable prefix for home-chain account addresses.
pub const ADDRESS_HRP: &str = "pc";

/// Encrypted-at-rest blob: PBKDF2 salt, AES-GCM nonce, ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBlob {
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

pub(crate) fn seal(plaintext: &[u8], password: &str) -> Result<SealedBlob> {
    let mut salt = [0u8; SALT_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut key);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| anyhow!("cipher init: {e}"))?;
    key.zeroize();

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| anyhow!("encryption failed"))?;

    Ok(SealedBlob {
        salt: BASE64.encode(salt),
        nonce: BASE64.encode(nonce_bytes),
        ciphertext: BASE64.encode(ciphertext),
    })
}

pub(crate) fn open_sealed(blob: &SealedBlob, password: &str) -> Result<Vec<u8>> {
    let salt = BASE64.decode(&blob.salt).context("bad salt encoding")?;
    let nonce = BASE64.decode(&blob.nonce).context("bad nonce encoding")?;
    let ciphertext = BASE64
        .decode(&blob.ciphertext)
        .context("bad ciphertext encoding")?;

    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut key);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| anyhow!("cipher init: {e}"))?;
    key.zeroize();

    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| anyhow!("decryption failed (wrong keyring password?)"))
}

/// Which keyring flavour `node_home` uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyringBackend {
    File,
    Test,
}

impl KeyringBackend {
    fn dir_name(&self) -> &'static str {
        match self {
            KeyringBackend::File => "keyring-file",
            KeyringBackend::Test => "keyring-test",
        }
    }
}

/// On-disk key record. The secret field is sealed for the `file` backend and
/// plain hex for the `test` backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    name: String,
    address: String,
    public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sealed: Option<SealedBlob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plain_hex: Option<String>,
    created_at: String,
}

/// Secret scalar wrapper, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SecretScalar([u8; 32]);

impl std::fmt::Debug for SecretScalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// A usable signing key loaded from the keyring.
pub struct HotKey {
    pub name: String,
    pub address: String,
    secret: SecretScalar,
}

impl HotKey {
    fn signing_key(&self) -> Result<SigningKey> {
        SigningKey::from_bytes(&self.secret.0.into()).map_err(|e| anyhow!("corrupt hot key: {e}"))
    }

    pub fn public_key(&self) -> Result<VerifyingKey> {
        Ok(*self.signing_key()?.verifying_key())
    }

    /// Compressed SEC1 public key bytes.
    pub fn public_key_bytes(&self) -> Result<Vec<u8>> {
        Ok(self
            .public_key()?
            .to_encoded_point(true)
            .as_bytes()
            .to_vec())
    }

    /// ECDSA over a 32-byte prehash.
    pub fn sign_prehash(&self, hash: &[u8]) -> Result<Signature> {
        Ok(self.signing_key()?.sign_prehash(hash)?)
    }
}

/// Derive the bech32 account address from a compressed secp256k1 public key.
pub fn address_from_public_key(compressed: &[u8]) -> Result<String> {
    let digest = Sha256::digest(compressed);
    let hrp = bech32::Hrp::parse(ADDRESS_HRP).map_err(|e| anyhow!("invalid hrp: {e}"))?;
    bech32::encode::<bech32::Bech32>(hrp, &digest[..20])
        .map_err(|e| anyhow!("bech32 encode: {e}"))
}

pub struct Keyring {
    dir: PathBuf,
    backend: KeyringBackend,
    password: Option<String>,
}

impl Keyring {
    /// Open the keyring directory under `node_home`. The `file` backend
    /// requires a password.
    pub fn open(
        node_home: &Path,
        backend: KeyringBackend,
        password: Option<String>,
    ) -> Result<Self> {
        if backend == KeyringBackend::File && password.as_deref().unwrap_or("").is_empty() {
            bail!("keyring backend 'file' requires keyring_password");
        }
        let dir = node_home.join(backend.dir_name());
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self { dir, backend, password })
    }

    /// Key names present, sorted. The first one is the daemon's hot key.
    pub fn key_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Generate and persist a new key. Refuses to overwrite an existing name.
    pub fn create_key(&self, name: &str) -> Result<HotKey> {
        let path = self.key_path(name);
        if path.exists() {
            bail!("key {name} already exists in keyring");
        }

        let signing = SigningKey::random(&mut rand::rngs::OsRng);
        let secret: [u8; 32] = signing.to_bytes().into();
        let compressed = signing.verifying_key().to_encoded_point(true);
        let address = address_from_public_key(compressed.as_bytes())?;

        let (sealed, plain_hex) = match self.backend {
            KeyringBackend::File => {
                let password = self.password.as_deref().unwrap_or_default();
                (Some(seal(&secret, password)?), None)
            }
            KeyringBackend::Test => (None, Some(hex::encode(secret))),
        };

        let record = KeyFile {
            version: 1,
            name: name.to_string(),
            address: address.clone(),
            public_key: hex::encode(compressed.as_bytes()),
            sealed,
            plain_hex,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        fs::write(&path, serde_json::to_string_pretty(&record)?)
            .with_context(|| format!("writing {}", path.display()))?;

        Ok(HotKey {
            name: name.to_string(),
            address,
            secret: SecretScalar(secret),
        })
    }

    pub fn load_key(&self, name: &str) -> Result<HotKey> {
        let path = self.key_path(name);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading key file {}", path.display()))?;
        let record: KeyFile = serde_json::from_str(&raw)?;

        let mut secret_bytes = match (&record.sealed, &record.plain_hex) {
            (Some(sealed), _) => {
                let password = self.password.as_deref().unwrap_or_default();
                open_sealed(sealed, password)?
            }
            (None, Some(plain)) => hex::decode(plain).context("corrupt test key file")?,
            (None, None) => bail!("key file {name} has no secret material"),
        };
        let secret: [u8; 32] = secret_bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("key file {name} has a malformed secret"))?;
        secret_bytes.zeroize();

        Ok(HotKey {
            name: record.name,
            address: record.address,
            secret: SecretScalar(secret),
        })
    }

    /// The daemon's hot key: the first key in the ring. Fails when the ring
    /// is empty.
    pub fn hot_key(&self, preferred: Option<&str>) -> Result<HotKey> {
        if let Some(name) = preferred {
            return self.load_key(name);
        }
        let names = self.key_names()?;
        let first = names
            .first()
            .ok_or_else(|| anyhow!("keyring holds no keys; run `uvd keygen` first"))?;
        self.load_key(first)
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::signature::hazmat::PrehashVerifier;

    #[test]
    fn seal_open_round_trip() {
        let blob = seal(b"secret bytes", "hunter2").unwrap();
        assert_eq!(open_sealed(&blob, "hunter2").unwrap(), b"secret bytes");
        assert!(open_sealed(&blob, "wrong").is_err());
    }

    #[test]
    fn file_backend_requires_password() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Keyring::open(dir.path(), KeyringBackend::File, None).is_err());
        assert!(Keyring::open(dir.path(), KeyringBackend::File, Some("pw".into())).is_ok());
    }

    #[test]
    fn create_load_and_sign() {
        let dir = tempfile::tempdir().unwrap();
        let ring = Keyring::open(dir.path(), KeyringBackend::File, Some("pw".into())).unwrap();
        let created = ring.create_key("hotkey").unwrap();
        let loaded = ring.load_key("hotkey").unwrap();
        assert_eq!(created.address, loaded.address);
        assert!(loaded.address.starts_with(ADDRESS_HRP));

        let hash = Sha256::digest(b"tx body");
        let sig = loaded.sign_prehash(&hash).unwrap();
        loaded.public_key().unwrap().verify_prehash(&hash, &sig).unwrap();
    }

    #[test]
    fn hot_key_is_first_sorted_name() {
        let dir = tempfile::tempdir().unwrap();
        let ring = Keyring::open(dir.path(), KeyringBackend::Test, None).unwrap();
        ring.create_key("zeta").unwrap();
        ring.create_key("alpha").unwrap();
        assert_eq!(ring.hot_key(None).unwrap().name, "alpha");
        assert_eq!(ring.hot_key(Some("zeta")).unwrap().name, "zeta");
    }

    #[test]
    fn empty_ring_has_no_hot_key() {
        let dir = tempfile::tempdir().unwrap();
        let ring = Keyring::open(dir.path(), KeyringBackend::Test, None).unwrap();
        assert!(ring.hot_key(None).is_err());
    }

    #[test]
    fn duplicate_key_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ring = Keyring::open(dir.path(), KeyringBackend::Test, None).unwrap();
        ring.create_key("hotkey").unwrap();
        assert!(ring.create_key("hotkey").is_err());
    }
}
