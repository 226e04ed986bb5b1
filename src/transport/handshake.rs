// src/transport/handshake.rs
// Mutual Ed25519 challenge/response over length-delimited JSON frames.

use anyhow::{anyhow, bail, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// The node's transport identity. The peer id is the hex of the Ed25519
/// public key, so authentication pins the id itself.
#[derive(Clone)]
pub struct Identity {
    signing: SigningKey,
    peer_id: String,
}

impl Identity {
    /// Build from a 32-byte Ed25519 seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| anyhow!("p2p key seed must be 32 bytes, got {}", seed.len()))?;
        let signing = SigningKey::from_bytes(&seed);
        let peer_id = hex::encode(signing.verifying_key().to_bytes());
        Ok(Self { signing, peer_id })
    }

    pub fn from_seed_hex(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|_| anyhow!("p2p private key is not valid hex"))?;
        Self::from_seed(&bytes)
    }

    /// Fresh random identity, used by `keygen` and tests.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        let signing = SigningKey::from_bytes(&seed);
        let peer_id = hex::encode(signing.verifying_key().to_bytes());
        Self { signing, peer_id }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }
}

/// First frame from the dialer.
#[derive(Serialize, Deserialize, Debug)]
struct Hello {
    peer_id: String,
    public_key: String,
    protocol_id: String,
    /// Challenge for the listener, hex.
    nonce: String,
}

/// Listener's answer: its own identity, its signature over the dialer's
/// nonce, and a counter-challenge.
#[derive(Serialize, Deserialize, Debug)]
struct ChallengeReply {
    peer_id: String,
    public_key: String,
    protocol_id: String,
    signature: String,
    nonce: String,
}

/// Dialer's proof over the listener's nonce.
#[derive(Serialize, Deserialize, Debug)]
struct Proof {
    signature: String,
}

pub type FramedStream<S> = Framed<S, LengthDelimitedCodec>;

fn fresh_nonce() -> String {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    hex::encode(nonce)
}

fn verify_peer(peer_id: &str, public_key_hex: &str, nonce_hex: &str, sig_hex: &str) -> Result<()> {
    if peer_id != public_key_hex {
        bail!("peer id does not match public key");
    }
    let key_bytes: [u8; 32] = hex::decode(public_key_hex)
        .map_err(|_| anyhow!("public key is not hex"))?
        .try_into()
        .map_err(|_| anyhow!("public key must be 32 bytes"))?;
    let key = VerifyingKey::from_bytes(&key_bytes)?;
    let nonce = hex::decode(nonce_hex).map_err(|_| anyhow!("nonce is not hex"))?;
    let sig_bytes: [u8; 64] = hex::decode(sig_hex)
        .map_err(|_| anyhow!("signature is not hex"))?
        .try_into()
        .map_err(|_| anyhow!("signature must be 64 bytes"))?;
    key.verify(&nonce, &Signature::from_bytes(&sig_bytes))?;
    Ok(())
}

async fn send_json<S, T>(framed: &mut FramedStream<S>, msg: &T) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    framed.send(serde_json::to_vec(msg)?.into()).await?;
    Ok(())
}

async fn recv_json<S, T>(framed: &mut FramedStream<S>) -> Result<T>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let frame = framed
        .next()
        .await
        .ok_or_else(|| anyhow!("peer closed during handshake"))??;
    Ok(serde_json::from_slice(&frame)?)
}

/// Dialer side. Returns the authenticated remote peer id and the framed
/// stream ready for data frames.
pub async fn connect<S>(
    stream: S,
    identity: &Identity,
    protocol_id: &str,
) -> Result<(String, FramedStream<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let nonce = fresh_nonce();
    send_json(
        &mut framed,
        &Hello {
            peer_id: identity.peer_id.clone(),
            public_key: identity.peer_id.clone(),
            protocol_id: protocol_id.to_string(),
            nonce: nonce.clone(),
        },
    )
    .await?;

    let reply: ChallengeReply = recv_json(&mut framed).await?;
    if reply.protocol_id != protocol_id {
        bail!(
            "protocol id mismatch: ours {}, theirs {}",
            protocol_id,
            reply.protocol_id
        );
    }
    verify_peer(&reply.peer_id, &reply.public_key, &nonce, &reply.signature)?;

    let signature = identity
        .signing
        .sign(&hex::decode(&reply.nonce).map_err(|_| anyhow!("nonce is not hex"))?);
    send_json(
        &mut framed,
        &Proof {
            signature: hex::encode(signature.to_bytes()),
        },
    )
    .await?;

    Ok((reply.peer_id, framed))
}

/// Listener side of the same exchange.
pub async fn accept<S>(
    stream: S,
    identity: &Identity,
    protocol_id: &str,
) -> Result<(String, FramedStream<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let hello: Hello = recv_json(&mut framed).await?;
    if hello.protocol_id != protocol_id {
        bail!(
            "protocol id mismatch: ours {}, theirs {}",
            protocol_id,
            hello.protocol_id
        );
    }
    if hello.peer_id != hello.public_key {
        bail!("peer id does not match public key");
    }

    let their_nonce = hex::decode(&hello.nonce).map_err(|_| anyhow!("nonce is not hex"))?;
    let signature = identity.signing.sign(&their_nonce);
    let nonce = fresh_nonce();
    send_json(
        &mut framed,
        &ChallengeReply {
            peer_id: identity.peer_id.clone(),
            public_key: identity.peer_id.clone(),
            protocol_id: protocol_id.to_string(),
            signature: hex::encode(signature.to_bytes()),
            nonce: nonce.clone(),
        },
    )
    .await?;

    let proof: Proof = recv_json(&mut framed).await?;
    verify_peer(&hello.peer_id, &hello.public_key, &nonce, &proof.signature)?;

    Ok((hello.peer_id, framed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn handshake_authenticates_both_sides() {
        let server_id = Identity::generate();
        let client_id = Identity::generate();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = {
            let server_id = server_id.clone();
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                accept(stream, &server_id, "uv/test/1").await.unwrap()
            })
        };

        let stream = TcpStream::connect(addr).await.unwrap();
        let (seen_server, _framed) = connect(stream, &client_id, "uv/test/1").await.unwrap();
        let (seen_client, _framed) = server.await.unwrap();

        assert_eq!(seen_server, server_id.peer_id());
        assert_eq!(seen_client, client_id.peer_id());
    }

    #[tokio::test]
    async fn protocol_mismatch_is_rejected() {
        let server_id = Identity::generate();
        let client_id = Identity::generate();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream, &server_id, "uv/test/1").await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = connect(stream, &client_id, "uv/other/9").await;
        assert!(client.is_err() || server.await.unwrap().is_err());
    }

    #[test]
    fn identity_round_trips_through_seed_hex() {
        let id = Identity::generate();
        let back = Identity::from_seed_hex(&id.seed_hex()).unwrap();
        assert_eq!(id.peer_id(), back.peer_id());
    }
}
