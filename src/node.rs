//! The orchestrator: wires `Identity`, `Store`, `LinkLayer`, `Gossip`,
//! `CryptoBox`, and `Discovery` together and implements channel and
//! encryption policy on top of the gossip engine's mechanical pipeline.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::config::NodeConfig;
use crate::crypto::{self, ChannelKey};
use crate::discovery::{Discovery, DiscoveryEvent};
use crate::error::{DropReason, NodeError};
use crate::gossip::{Dispatch, Gossip, GossipCounters};
use crate::identity::Identity;
use crate::link::{InboundFrame, LinkLayer};
use crate::store::{self, StoreStats};
use crate::wire::{self, payload_type, ChatMessagePayload, InvitePayload};

const GENERAL_CHANNEL: &str = "#general";

fn channel_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^#[a-z0-9_-]+$").unwrap())
}

pub fn validate_channel_id(channel_id: &str) -> Result<(), NodeError> {
    if channel_id_pattern().is_match(channel_id) {
        Ok(())
    } else {
        Err(NodeError::InvalidChannelId(channel_id.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Private,
}

impl ChannelKind {
    fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Public => "public",
            ChannelKind::Private => "private",
        }
    }
}

/// Delivered to the UI layer (or, in this crate, to anyone holding a
/// receiver from `Node::subscribe_events`).
#[derive(Debug, Clone)]
pub enum NodeEvent {
    ChatMessage { channel_id: String, sender_id: String, content: String, is_private: bool, timestamp: String },
    ChannelJoined { channel_id: String },
}

#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub store: StoreStats,
    pub gossip: GossipCounters,
    pub seen_len: usize,
    pub peers: HashSet<String>,
}

/// Shared state the dispatch callback needs, separated from `Node` itself
/// so it can be handed to `Gossip` without a reference cycle.
#[derive(Clone)]
struct NodeDispatch {
    self_id: String,
    encryption_secret_bytes: [u8; 32],
    store: SqlitePool,
    channel_keys: Arc<Mutex<HashMap<String, ChannelKey>>>,
    subscribed: Arc<Mutex<HashSet<String>>>,
    events_tx: broadcast::Sender<NodeEvent>,
    /// Shared with `Gossip` so the no-key/decrypt-failure drops this policy
    /// layer observes land in the same tallies `NodeStats` reports.
    counters: Arc<Mutex<GossipCounters>>,
}

impl Dispatch for NodeDispatch {
    fn dispatch(&self, envelope: &wire::Envelope) {
        let envelope = envelope.clone();
        let this = self.clone();
        tokio::spawn(async move { this.handle(envelope).await });
    }
}

impl NodeDispatch {
    async fn handle(&self, envelope: wire::Envelope) {
        match wire::type_of(&envelope.payload) {
            Some(payload_type::HELLO) => {
                // Noted only; no persistence, no UI surface.
            }
            Some(payload_type::CHAT_MESSAGE) => self.handle_chat(envelope).await,
            Some(payload_type::INVITE) => self.handle_invite(envelope).await,
            _ => {}
        }
    }

    async fn handle_chat(&self, envelope: wire::Envelope) {
        let payload: ChatMessagePayload = match serde_json::from_value(envelope.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "malformed chat_message payload");
                return;
            }
        };

        let plaintext = if payload.is_encrypted {
            let key = {
                let keys = self.channel_keys.lock().await;
                keys.get(&payload.channel_id).cloned()
            };
            let Some(key) = key else {
                tracing::debug!(channel = %payload.channel_id, "dropping private message: no channel key");
                self.counters.lock().await.record_dropped(DropReason::NoChannelKey);
                return;
            };
            let Some(nonce) = &payload.nonce else {
                tracing::debug!("dropping private message: missing nonce");
                self.counters.lock().await.record_dropped(DropReason::DecryptFailure);
                return;
            };
            match crypto::decrypt(&key, nonce, &payload.content) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(s) => s,
                    Err(_) => {
                        tracing::debug!("dropping private message: decrypted content was not UTF-8");
                        self.counters.lock().await.record_dropped(DropReason::DecryptFailure);
                        return;
                    }
                },
                Err(_) => {
                    tracing::debug!(channel = %payload.channel_id, "dropping private message: AEAD decryption failed");
                    self.counters.lock().await.record_dropped(DropReason::DecryptFailure);
                    return;
                }
            }
        } else {
            payload.content.clone()
        };

        if let Err(e) = store::put_message(
            &self.store,
            &envelope.msg_id,
            &payload.channel_id,
            &envelope.sender_id,
            &payload.timestamp,
            &payload.content,
            &envelope.signature,
            payload.is_encrypted,
            payload.nonce.as_deref(),
            &Utc::now().to_rfc3339(),
        )
        .await
        {
            tracing::warn!(error = %e, "failed to persist message");
        }

        let _ = self.events_tx.send(NodeEvent::ChatMessage {
            channel_id: payload.channel_id,
            sender_id: envelope.sender_id,
            content: plaintext,
            is_private: payload.is_encrypted,
            timestamp: payload.timestamp,
        });
    }

    async fn handle_invite(&self, envelope: wire::Envelope) {
        let payload: InvitePayload = match serde_json::from_value(envelope.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "malformed INVITE payload");
                return;
            }
        };

        if payload.target_node_id != self.self_id {
            return; // not addressed to us; already gossiped unchanged by Gossip::handle
        }

        let key_bytes = match crypto::unseal(&self.encryption_secret_bytes, &payload.encrypted_key) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(error = %e, "failed to unseal invite key");
                return;
            }
        };
        let key_arr: [u8; 32] = match key_bytes.try_into() {
            Ok(arr) => arr,
            Err(_) => {
                tracing::debug!("invite carried a key of unexpected length");
                return;
            }
        };
        let key = ChannelKey(key_arr);

        // The private channel being invited to is `invite_channel_id`, not
        // the envelope's own `channel_id` (always `#general`, the channel
        // this INVITE was gossiped on so non-members still relay it).
        let channel_id = payload.invite_channel_id;

        self.channel_keys.lock().await.insert(channel_id.clone(), key);

        if let Err(e) = store::put_channel(
            &self.store,
            &channel_id,
            &payload.channel_name,
            &payload.channel_type,
            &envelope.sender_id,
            &envelope.payload.get("timestamp").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        )
        .await
        {
            tracing::warn!(error = %e, "failed to persist invited channel");
        }
        if let Err(e) = store::put_member(&self.store, &channel_id, &self.self_id, "member", &Utc::now().to_rfc3339()).await {
            tracing::warn!(error = %e, "failed to persist channel membership");
        }

        self.subscribed.lock().await.insert(channel_id.clone());
        let _ = self.events_tx.send(NodeEvent::ChannelJoined { channel_id });
    }
}

pub struct Node {
    identity: Arc<Identity>,
    store: SqlitePool,
    link: LinkLayer,
    gossip: Arc<Gossip<NodeDispatch>>,
    subscribed: Arc<Mutex<HashSet<String>>>,
    channel_keys: Arc<Mutex<HashMap<String, ChannelKey>>>,
    events_tx: broadcast::Sender<NodeEvent>,
    local_addr: SocketAddr,
}

impl Node {
    /// Bring up a node: open the store, load identity, bind the link layer
    /// on an OS-chosen ephemeral port, and start the gossip engine's inbound
    /// loop. Discovery is started separately via `spawn_discovery`, since
    /// tests frequently want a node without LAN broadcast.
    pub async fn start(
        config: NodeConfig,
        profile_path: impl AsRef<std::path::Path>,
        store_path: &str,
    ) -> Result<Arc<Node>, NodeError> {
        let identity = Arc::new(Identity::load_or_create(profile_path, &config.username)?);
        let store = store::open(store_path).await?;

        let now = Utc::now().to_rfc3339();
        store::put_channel(&store, GENERAL_CHANNEL, "General", "public", &identity.public_id(), &now).await?;
        store::put_member(&store, GENERAL_CHANNEL, &identity.public_id(), "owner", &now).await?;

        let subscribed = Arc::new(Mutex::new(HashSet::from([GENERAL_CHANNEL.to_string()])));
        let channel_keys = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, _) = broadcast::channel(256);

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundFrame>(256);
        let link = LinkLayer::new(config.clone(), inbound_tx);
        let local_addr = link.listen("0.0.0.0:0".parse().unwrap()).await?;

        let counters = Arc::new(Mutex::new(GossipCounters::default()));
        let dispatch = NodeDispatch {
            self_id: identity.public_id(),
            encryption_secret_bytes: identity_secret_bytes(&identity),
            store: store.clone(),
            channel_keys: channel_keys.clone(),
            subscribed: subscribed.clone(),
            events_tx: events_tx.clone(),
            counters: counters.clone(),
        };
        let gossip = Arc::new(Gossip::with_counters(
            config.initial_ttl,
            config.seen_capacity,
            subscribed.clone(),
            dispatch,
            counters,
        ));

        let node = Arc::new(Node { identity, store, link, gossip, subscribed, channel_keys, events_tx, local_addr });

        let gossip_loop = node.gossip.clone();
        let link_loop = node.link.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound_rx.recv().await {
                let disposition = gossip_loop.handle(frame.envelope, &link_loop).await;
                tracing::debug!(?disposition, from = %frame.from, "processed inbound frame");
            }
        });

        Ok(node)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn public_id(&self) -> String {
        self.identity.public_id()
    }

    /// This node's X25519 public key, advertised so other nodes can target
    /// it with an invite (see `Identity::encryption_public_id`).
    pub fn public_id_encryption_key(&self) -> String {
        self.identity.encryption_public_id()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events_tx.subscribe()
    }

    /// Start a discovery backend; bridges `PeerUp`/`PeerDown` into
    /// `LinkLayer::dial`/`disconnect`.
    pub fn spawn_discovery<D: Discovery + Send + 'static>(self: &Arc<Self>, discovery: D) {
        let (tx, mut rx) = mpsc::channel::<DiscoveryEvent>(64);
        tokio::spawn(async move {
            if let Err(e) = discovery.run(tx).await {
                tracing::warn!(error = %e, "discovery backend exited");
            }
        });

        let node = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    DiscoveryEvent::PeerUp { node_id, addr } => {
                        if let Err(e) = node.link.dial(node_id.clone(), addr).await {
                            tracing::debug!(peer = %node_id, error = %e, "dial failed");
                        }
                    }
                    DiscoveryEvent::PeerDown { node_id } => {
                        node.link.disconnect(&node_id).await;
                    }
                }
            }
        });
    }

    pub async fn dial(&self, node_id: String, addr: SocketAddr) -> Result<(), NodeError> {
        self.link.dial(node_id, addr).await.map_err(NodeError::from)
    }

    /// Create a channel. For `private`, mints a key, records ownership,
    /// adds self as owner-member, and subscribes.
    pub async fn create(&self, channel_id: &str, name: &str, kind: ChannelKind) -> Result<(), NodeError> {
        validate_channel_id(channel_id)?;
        if store::get_channel(&self.store, channel_id).await?.is_some() {
            return Err(NodeError::ChannelExists(channel_id.to_string()));
        }

        let now = Utc::now().to_rfc3339();
        store::put_channel(&self.store, channel_id, name, kind.as_str(), &self.identity.public_id(), &now).await?;
        store::put_member(&self.store, channel_id, &self.identity.public_id(), "owner", &now).await?;

        if kind == ChannelKind::Private {
            let key = crypto::new_channel_key();
            self.channel_keys.lock().await.insert(channel_id.to_string(), key);
        }

        self.subscribed.lock().await.insert(channel_id.to_string());
        Ok(())
    }

    /// Invite `target_id` to a private channel we own. Wraps the channel
    /// key with the target's X25519 public key and broadcasts the wrapped
    /// key publicly — only the target can open it.
    pub async fn invite(&self, channel_id: &str, target_node_id: &str, target_encryption_pubkey: &str) -> Result<(), NodeError> {
        let channel = store::get_channel(&self.store, channel_id)
            .await?
            .ok_or_else(|| NodeError::ChannelNotFound(channel_id.to_string()))?;
        if channel.owner_node_id != self.identity.public_id() {
            return Err(NodeError::NotOwner(channel_id.to_string()));
        }

        let key = {
            let keys = self.channel_keys.lock().await;
            keys.get(channel_id).cloned().ok_or_else(|| NodeError::ChannelNotFound(channel_id.to_string()))?
        };
        let encrypted_key = crypto::seal_for(target_encryption_pubkey, &key.0)?;

        let payload = json!({
            "type": payload_type::INVITE,
            "channel_id": GENERAL_CHANNEL,
            "timestamp": Utc::now().to_rfc3339(),
            "target_node_id": target_node_id,
            "invite_channel_id": channel_id,
            "channel_name": channel.name,
            "channel_type": channel.kind,
            "encrypted_key": encrypted_key,
        });

        self.gossip.broadcast(&self.identity, payload, &self.link).await;
        Ok(())
    }

    pub async fn join(&self, channel_id: &str) -> Result<(), NodeError> {
        validate_channel_id(channel_id)?;
        self.subscribed.lock().await.insert(channel_id.to_string());
        Ok(())
    }

    pub async fn leave(&self, channel_id: &str) -> Result<(), NodeError> {
        if channel_id == GENERAL_CHANNEL {
            return Err(NodeError::InvalidChannelId(channel_id.to_string()));
        }
        self.subscribed.lock().await.remove(channel_id);
        Ok(())
    }

    /// Broadcast a chat message. Encrypts automatically if a channel key is
    /// held for `channel_id` (i.e. it's a private channel we've joined).
    pub async fn send(&self, channel_id: &str, content: &str) -> Result<String, NodeError> {
        let key = self.channel_keys.lock().await.get(channel_id).cloned();
        let timestamp = Utc::now().to_rfc3339();

        let payload = match key {
            Some(key) => {
                let sealed = crypto::encrypt(&key, content.as_bytes());
                json!({
                    "type": payload_type::CHAT_MESSAGE,
                    "channel_id": channel_id,
                    "timestamp": timestamp,
                    "content": sealed.ciphertext_hex,
                    "nonce": sealed.nonce_hex,
                    "is_encrypted": true,
                })
            }
            None => {
                // No key in hand. That's only safe to treat as a public send
                // if the channel itself is public — a private channel whose
                // key we've lost (or never held) must refuse to send rather
                // than leak plaintext tagged as public traffic.
                let is_private = store::get_channel(&self.store, channel_id)
                    .await?
                    .map(|c| c.kind == "private")
                    .unwrap_or(false);
                if is_private {
                    return Err(NodeError::NoChannelKey(channel_id.to_string()));
                }
                json!({
                    "type": payload_type::CHAT_MESSAGE,
                    "channel_id": channel_id,
                    "timestamp": timestamp,
                    "content": content,
                })
            }
        };

        let msg_id = self.gossip.broadcast(&self.identity, payload, &self.link).await;
        Ok(msg_id)
    }

    pub async fn stats(&self) -> Result<NodeStats, NodeError> {
        Ok(NodeStats {
            store: store::stats(&self.store).await?,
            gossip: self.gossip.counters().await,
            seen_len: self.gossip.seen_len().await,
            peers: self.link.peers().await,
        })
    }
}

fn identity_secret_bytes(identity: &Identity) -> [u8; 32] {
    // `Identity` keeps its X25519 secret private; callers that need the raw
    // bytes for crypto_box::unseal go through this accessor rather than
    // having `crypto` reach into `identity`'s internals.
    identity.encryption_secret().to_bytes()
}
