// src/transport/mod.rs
//! Authenticated point-to-point byte delivery between validators.
//!
//! One TCP listener, one outbound connection per remote peer, length-delimited
//! frames. Every connection is authenticated by the mutual Ed25519 handshake
//! before a single data frame is accepted. Inbound frames are handed to the
//! single process-wide handler installed at startup.

pub mod handshake;

pub use handshake::Identity;

use anyhow::{anyhow, bail, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Installed once; receives `(sender peer id, frame bytes)` for every
/// authenticated inbound frame.
pub type MessageHandler = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

struct PeerHandle {
    outbound: mpsc::Sender<Vec<u8>>,
    /// Identifies which connection backs this entry, so a stale connection's
    /// cleanup cannot evict a newer one under the same peer id.
    conn_id: u64,
}

type PeerMap = Arc<RwLock<HashMap<String, PeerHandle>>>;
type HandlerSlot = Arc<RwLock<Option<MessageHandler>>>;

pub struct Transport {
    identity: Identity,
    protocol_id: String,
    peers: PeerMap,
    handler: HandlerSlot,
    shutdown: watch::Receiver<bool>,
    local_addr: std::net::SocketAddr,
    next_conn_id: std::sync::atomic::AtomicU64,
}

fn remove_if_current(peers: &PeerMap, peer_id: &str, conn_id: u64) {
    let mut peers = peers.write();
    if peers.get(peer_id).map(|h| h.conn_id) == Some(conn_id) {
        peers.remove(peer_id);
    }
}

impl Transport {
    /// Bind the listener and start accepting authenticated connections.
    pub async fn start(
        listen_addr: &str,
        protocol_id: &str,
        identity: Identity,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let transport = Arc::new(Self {
            identity,
            protocol_id: protocol_id.to_string(),
            peers: Arc::new(RwLock::new(HashMap::new())),
            handler: Arc::new(RwLock::new(None)),
            shutdown: shutdown.clone(),
            local_addr,
            next_conn_id: std::sync::atomic::AtomicU64::new(0),
        });
        info!(addr = %local_addr, peer_id = %transport.identity.peer_id(), "p2p transport listening");

        let accept_self = transport.clone();
        let mut accept_shutdown = shutdown;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.changed() => {
                        info!("p2p listener shutting down");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                let this = accept_self.clone();
                                tokio::spawn(async move {
                                    match handshake::accept(stream, &this.identity, &this.protocol_id).await {
                                        Ok((remote_peer, framed)) => this.register(remote_peer, framed),
                                        Err(e) => debug!(%remote, "inbound connection dropped: {e:#}"),
                                    }
                                });
                            }
                            Err(e) => {
                                warn!("accept failed: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(transport)
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn peer_id(&self) -> &str {
        self.identity.peer_id()
    }

    /// Install the process-wide inbound handler. Later installs replace the
    /// earlier one; the daemon does this exactly once at startup.
    pub fn set_handler(&self, handler: MessageHandler) {
        *self.handler.write() = Some(handler);
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    /// Make sure a connection to `peer_id` exists, dialing `addresses` in
    /// order until one completes the handshake. No-op when already connected.
    pub async fn ensure_peer(&self, peer_id: &str, addresses: &[String]) -> Result<()> {
        if peer_id == self.identity.peer_id() || self.is_connected(peer_id) {
            return Ok(());
        }
        let mut last_err = anyhow!("no addresses for peer {peer_id}");
        for addr in addresses {
            match self.dial(peer_id, addr).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(peer = %peer_id, %addr, "dial failed: {e:#}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn dial(&self, expected_peer: &str, addr: &str) -> Result<()> {
        let stream = TcpStream::connect(addr).await?;
        let (remote_peer, framed) =
            handshake::connect(stream, &self.identity, &self.protocol_id).await?;
        if remote_peer != expected_peer {
            bail!("dialed {addr} expecting {expected_peer}, got {remote_peer}");
        }
        self.register(remote_peer, framed);
        Ok(())
    }

    /// Deliver one frame to a connected peer. Registration must have happened
    /// first; retries are the caller's policy.
    pub async fn send(&self, peer_id: &str, bytes: Vec<u8>) -> Result<()> {
        let sender = {
            let peers = self.peers.read();
            peers
                .get(peer_id)
                .map(|h| h.outbound.clone())
                .ok_or_else(|| anyhow!("peer {peer_id} not registered"))?
        };
        sender
            .send(bytes)
            .await
            .map_err(|_| anyhow!("connection to {peer_id} closed"))
    }

    /// Wire an authenticated connection into the peer table: a writer task
    /// draining the outbound queue and a reader loop feeding the handler.
    fn register(&self, peer_id: String, framed: handshake::FramedStream<TcpStream>) {
        let (mut sink, mut stream) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        let conn_id = self
            .next_conn_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.peers
            .write()
            .insert(peer_id.clone(), PeerHandle { outbound: tx, conn_id });
        debug!(peer = %peer_id, conn_id, "peer registered");

        let writer_peer = peer_id.clone();
        let writer_peers = self.peers.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = sink.send(bytes.into()).await {
                    warn!(peer = %writer_peer, "send failed: {e}");
                    break;
                }
            }
            remove_if_current(&writer_peers, &writer_peer, conn_id);
        });

        let reader_peers = self.peers.clone();
        let reader_handler = self.handler.clone();
        let mut reader_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_shutdown.changed() => break,
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(bytes)) => {
                                let handler = reader_handler.read().clone();
                                match handler {
                                    Some(handler) => handler(peer_id.clone(), bytes.to_vec()),
                                    None => warn!(peer = %peer_id, "frame received before handler installed"),
                                }
                            }
                            Some(Err(e)) => {
                                warn!(peer = %peer_id, "read failed: {e}");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            remove_if_current(&reader_peers, &peer_id, conn_id);
            debug!("peer connection closed");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn start_node() -> (Arc<Transport>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let transport = Transport::start("127.0.0.1:0", "uv/test/1", Identity::generate(), rx)
            .await
            .unwrap();
        (transport, tx)
    }

    #[tokio::test]
    async fn frames_flow_between_two_nodes() {
        let (a, _ka) = start_node().await;
        let (b, _kb) = start_node().await;

        let (got_tx, mut got_rx) = mpsc::channel::<(String, Vec<u8>)>(8);
        b.set_handler(Arc::new(move |peer, bytes| {
            let _ = got_tx.try_send((peer, bytes));
        }));

        a.ensure_peer(b.peer_id(), &[b.local_addr().to_string()])
            .await
            .unwrap();
        a.send(b.peer_id(), b"hello over tcp".to_vec()).await.unwrap();

        let (from, bytes) = tokio::time::timeout(Duration::from_secs(5), got_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, a.peer_id());
        assert_eq!(bytes, b"hello over tcp");
    }

    #[tokio::test]
    async fn ensure_peer_is_idempotent_and_send_to_unknown_fails() {
        let (a, _ka) = start_node().await;
        let (b, _kb) = start_node().await;

        let addr = vec![b.local_addr().to_string()];
        a.ensure_peer(b.peer_id(), &addr).await.unwrap();
        a.ensure_peer(b.peer_id(), &addr).await.unwrap();
        assert!(a.is_connected(b.peer_id()));

        assert!(a.send("deadbeef", b"x".to_vec()).await.is_err());
    }
}
