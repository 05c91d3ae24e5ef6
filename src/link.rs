//! The link layer: one TCP connection per peer, line-delimited JSON frames,
//! transport-only ACK/ERROR tokens. Everything here is about moving bytes
//! between nodes; nothing here understands gossip semantics.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use crate::config::NodeConfig;
use crate::wire::Envelope;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("dial to {0} timed out")]
    DialTimeout(SocketAddr),
    #[error("frame exceeded {limit} bytes")]
    FrameTooLarge { limit: usize },
    #[error("link closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A frame delivered up from the link layer, tagged with the peer it
/// arrived on. The gossip engine treats `from` as provisional until the
/// envelope's own `sender_id` is verified.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub from: String,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Dialing,
    Up,
    Draining,
    Closed,
}

struct PeerLink {
    state: Arc<Mutex<LinkState>>,
    send_tx: mpsc::Sender<String>,
}

/// Shared peer table plus the inbound channel every link's reader feeds
/// into. Cheap to clone — every clone shares the same table and channel.
#[derive(Clone)]
pub struct LinkLayer {
    peers: Arc<Mutex<HashMap<String, PeerLink>>>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    config: NodeConfig,
}

impl LinkLayer {
    pub fn new(config: NodeConfig, inbound_tx: mpsc::Sender<InboundFrame>) -> Self {
        LinkLayer { peers: Arc::new(Mutex::new(HashMap::new())), inbound_tx, config }
    }

    /// Bind `addr` and accept inbound connections for the lifetime of the
    /// returned task. The caller decides when to stop it (drop the
    /// JoinHandle's owning task, or let it run for the node's lifetime).
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, LinkError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let this = this.clone();
                        tokio::spawn(async move { this.serve_inbound(stream, peer_addr).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        Ok(local_addr)
    }

    /// Establish an outbound link to a known peer. No-op if the peer
    /// already has an `Up` link.
    pub async fn dial(&self, node_id: String, addr: SocketAddr) -> Result<(), LinkError> {
        {
            let peers = self.peers.lock().await;
            if let Some(link) = peers.get(&node_id) {
                if *link.state.lock().await == LinkState::Up {
                    return Ok(());
                }
            }
        }

        let state = Arc::new(Mutex::new(LinkState::Dialing));
        let stream = tokio::time::timeout(self.config.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| LinkError::DialTimeout(addr))??;

        *state.lock().await = LinkState::Up;
        self.spawn_link(node_id, stream, state).await;
        Ok(())
    }

    /// Send `envelope` to one peer's outbound queue. Returns `false` if the
    /// peer is unknown or its queue rejected the frame (never blocks).
    pub async fn send(&self, node_id: &str, envelope: &Envelope) -> bool {
        let line = match serde_json::to_string(envelope) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize outbound envelope");
                return false;
            }
        };
        let peers = self.peers.lock().await;
        match peers.get(node_id) {
            Some(link) => match link.send_tx.try_send(line) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(peer = node_id, "send queue full, dropping frame for this peer");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            None => false,
        }
    }

    /// Send `envelope` to every peer with an `Up` link. Returns the number
    /// of peers the frame was actually queued for.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let node_ids: Vec<String> = {
            let peers = self.peers.lock().await;
            peers.keys().cloned().collect()
        };
        let mut count = 0;
        for node_id in node_ids {
            if self.send(&node_id, envelope).await {
                count += 1;
            }
        }
        count
    }

    pub async fn disconnect(&self, node_id: &str) {
        let mut peers = self.peers.lock().await;
        if let Some(link) = peers.remove(node_id) {
            *link.state.lock().await = LinkState::Closed;
        }
    }

    pub async fn peers(&self) -> HashSet<String> {
        self.peers.lock().await.keys().cloned().collect()
    }

    async fn serve_inbound(&self, stream: TcpStream, peer_addr: SocketAddr) {
        // The peer's node_id isn't known until its first frame arrives; the
        // link is keyed provisionally under its socket address and re-keyed
        // the moment a signed envelope's sender_id is read.
        let provisional_key = format!("inbound:{peer_addr}");
        let state = Arc::new(Mutex::new(LinkState::Up));
        self.spawn_link(provisional_key, stream, state).await;
    }

    async fn spawn_link(&self, key: String, stream: TcpStream, state: Arc<Mutex<LinkState>>) {
        let (read_half, mut write_half) = stream.into_split();
        let (send_tx, mut send_rx) = mpsc::channel::<String>(self.config.send_queue_capacity);

        {
            let mut peers = self.peers.lock().await;
            peers.insert(key.clone(), PeerLink { state: state.clone(), send_tx });
        }

        tokio::spawn(async move {
            while let Some(line) = send_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = write_half.flush().await;
            }
        });

        let this = self.clone();
        let read_timeout = self.config.frame_read_timeout;
        let max_bytes = self.config.max_frame_bytes;
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut current_key = key;
            loop {
                let mut line = String::new();
                let read = tokio::time::timeout(read_timeout, reader.read_line(&mut line)).await;
                let n = match read {
                    Ok(Ok(n)) => n,
                    Ok(Err(_)) | Err(_) => break,
                };
                if n == 0 {
                    break; // EOF: peer closed cleanly.
                }
                if line.len() > max_bytes {
                    tracing::debug!(peer = %current_key, "frame exceeded max size, dropping");
                    continue;
                }
                let trimmed = line.trim_end_matches('\n');
                match serde_json::from_str::<Envelope>(trimmed) {
                    Ok(envelope) => {
                        this.ack(&current_key).await;
                        if current_key != envelope.sender_id {
                            this.rekey(&current_key, &envelope.sender_id).await;
                            current_key = envelope.sender_id.clone();
                        }
                        let frame = InboundFrame { from: current_key.clone(), envelope };
                        if this.inbound_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        this.error(&current_key).await;
                    }
                }
            }
            this.disconnect(&current_key).await;
        });
    }

    async fn ack(&self, key: &str) {
        self.write_token(key, "ACK\n").await;
    }

    async fn error(&self, key: &str) {
        self.write_token(key, "ERROR\n").await;
    }

    async fn write_token(&self, key: &str, token: &str) {
        let peers = self.peers.lock().await;
        if let Some(link) = peers.get(key) {
            let _ = link.send_tx.try_send(token.trim_end().to_string());
        }
    }

    /// Move a provisionally-keyed link (`inbound:<addr>`) to its real
    /// `node_id` once the first envelope reveals it. A peer that reconnects
    /// under the same node_id replaces its old entry.
    async fn rekey(&self, old_key: &str, new_key: &str) {
        let mut peers = self.peers.lock().await;
        if let Some(link) = peers.remove(old_key) {
            peers.insert(new_key.to_string(), link);
        }
    }
}
