//! The gossip engine: signing, the fixed verify→filter→dedup→dispatch→
//! forward pipeline, and broadcast. This module knows nothing about channel
//! membership policy or encryption — it only trusts the `subscribed`
//! predicate and `Store`/`CryptoBox` handles it is given.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{Disposition, DropReason};
use crate::identity::Identity;
use crate::wire::{self, Envelope};

/// Bounded FIFO of recently-seen `msg_id`s. Eviction happens on insert, once
/// the set reaches capacity — the oldest id is forgotten to make room for
/// the newest, never the other way around.
struct SeenSet {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        SeenSet { capacity: capacity.max(1), order: VecDeque::new(), members: HashSet::new() }
    }

    fn contains(&self, msg_id: &str) -> bool {
        self.members.contains(msg_id)
    }

    fn insert(&mut self, msg_id: String) {
        if self.members.contains(&msg_id) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(msg_id.clone());
        self.members.insert(msg_id);
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Tally of dispositions this engine has produced, exposed for
/// `Node::stats()`.
#[derive(Debug, Clone, Default)]
pub struct GossipCounters {
    pub accepted: u64,
    pub forwarded: u64,
    pub dropped_bad_signature: u64,
    pub dropped_not_subscribed: u64,
    pub dropped_duplicate: u64,
    pub dropped_no_channel_key: u64,
    pub dropped_decrypt_failure: u64,
    pub dropped_unknown_type: u64,
    pub dropped_invalid_encoding: u64,
}

impl GossipCounters {
    fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Accepted => self.accepted += 1,
            Disposition::Forwarded => {
                self.accepted += 1;
                self.forwarded += 1;
            }
            Disposition::Dropped(reason) => match reason {
                DropReason::BadSignature => self.dropped_bad_signature += 1,
                DropReason::NotSubscribed => self.dropped_not_subscribed += 1,
                DropReason::Duplicate => self.dropped_duplicate += 1,
                DropReason::NoChannelKey => self.dropped_no_channel_key += 1,
                DropReason::DecryptFailure => self.dropped_decrypt_failure += 1,
                DropReason::UnknownType => self.dropped_unknown_type += 1,
                DropReason::InvalidEncoding => self.dropped_invalid_encoding += 1,
            },
        }
    }

    /// Record a drop that happened outside `Gossip::handle` itself — the
    /// no-key and decrypt-failure checks live in `Node`'s encryption policy,
    /// which runs after `Gossip` has already dispatched the frame. Callers
    /// reach this through the same `Arc<Mutex<GossipCounters>>` handle
    /// `Gossip` was built with, so the tallies stay on one counter set.
    pub fn record_dropped(&mut self, reason: DropReason) {
        self.record(&Disposition::Dropped(reason));
    }
}

/// Callback invoked once per frame that clears steps 1-6 of `handle`. The
/// caller (`Node`) owns channel-membership and encryption policy; this
/// engine only needs to know whether to keep going and, if so, to hand the
/// envelope off.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, envelope: &Envelope);
}

pub struct Gossip<D: Dispatch> {
    initial_ttl: u8,
    subscribed: Arc<Mutex<HashSet<String>>>,
    seen: Mutex<SeenSet>,
    counters: Arc<Mutex<GossipCounters>>,
    dispatch: D,
}

impl<D: Dispatch> Gossip<D> {
    pub fn new(initial_ttl: u8, seen_capacity: usize, subscribed: Arc<Mutex<HashSet<String>>>, dispatch: D) -> Self {
        Self::with_counters(
            initial_ttl,
            seen_capacity,
            subscribed,
            dispatch,
            Arc::new(Mutex::new(GossipCounters::default())),
        )
    }

    /// Like `new`, but shares its counter tallies with a caller-supplied
    /// handle. `Node` uses this to fold the policy-layer drops it observes
    /// (no channel key, AEAD decrypt failure) into the same `GossipCounters`
    /// this engine's own pipeline updates.
    pub fn with_counters(
        initial_ttl: u8,
        seen_capacity: usize,
        subscribed: Arc<Mutex<HashSet<String>>>,
        dispatch: D,
        counters: Arc<Mutex<GossipCounters>>,
    ) -> Self {
        Gossip {
            initial_ttl,
            subscribed,
            seen: Mutex::new(SeenSet::new(seen_capacity)),
            counters,
            dispatch,
        }
    }

    /// Sign a payload, producing a ready-to-broadcast envelope with no
    /// `ttl` yet attached (the caller — `broadcast` — attaches it).
    pub fn sign(&self, identity: &Identity, payload: serde_json::Value) -> Envelope {
        let canon = wire::canonicalize(&payload);
        let signature = identity.sign(&canon);

        let mut hasher = Sha256::new();
        hasher.update(&canon);
        hasher.update(chrono::Utc::now().to_rfc3339().as_bytes());
        hasher.update(identity.public_id().as_bytes());
        let digest = hasher.finalize();
        let msg_id = hex::encode(&digest[..8]);

        Envelope {
            msg_id,
            sender_id: identity.public_id(),
            signature: hex::encode(signature.to_bytes()),
            ttl: None,
            payload,
        }
    }

    /// The fixed pipeline described by the protocol: verify, filter by
    /// subscription, dedup, dispatch, forward. Each step's ordering
    /// relative to the others is load-bearing (see the module comment).
    pub async fn handle(&self, envelope: Envelope, link_layer: &crate::link::LinkLayer) -> Disposition {
        let (disposition, new_ttl) = self.handle_inner(&envelope).await;

        if let Disposition::Forwarded = disposition {
            let mut forwarded = envelope;
            forwarded.ttl = Some(new_ttl);
            link_layer.broadcast(&forwarded).await;
        }

        self.counters.lock().await.record(&disposition);
        disposition
    }

    /// Returns the disposition plus, when `Forwarded`, the already-decremented
    /// `ttl` the onward copy should carry. A node forwards only when that
    /// decremented value is still positive — mirroring `forward_message`'s
    /// own `new_ttl <= 0` guard in the reference implementation, which is
    /// stricter than a naive "incoming ttl > 0" check: an envelope that
    /// arrives with `ttl == 1` is dispatched here but not forwarded further,
    /// so a line of `INITIAL_TTL + 1` nodes is reached, not `INITIAL_TTL + 2`.
    async fn handle_inner(&self, envelope: &Envelope) -> (Disposition, u8) {
        let canon = wire::canonicalize(&envelope.payload);
        if !Identity::verify(&canon, &envelope.signature, &envelope.sender_id) {
            return (Disposition::Dropped(DropReason::BadSignature), 0);
        }

        let channel_id = match wire::channel_id_of(&envelope.payload) {
            Some(id) => id.to_string(),
            None => return (Disposition::Dropped(DropReason::UnknownType), 0),
        };

        {
            let subscribed = self.subscribed.lock().await;
            if !subscribed.contains(&channel_id) {
                return (Disposition::Dropped(DropReason::NotSubscribed), 0);
            }
        }

        {
            let seen = self.seen.lock().await;
            if seen.contains(&envelope.msg_id) {
                return (Disposition::Dropped(DropReason::Duplicate), 0);
            }
        }
        self.seen.lock().await.insert(envelope.msg_id.clone());

        match wire::type_of(&envelope.payload) {
            Some(wire::payload_type::CHAT_MESSAGE) | Some(wire::payload_type::HELLO) | Some(wire::payload_type::INVITE) => {
                self.dispatch.dispatch(envelope);
            }
            _ => return (Disposition::Dropped(DropReason::UnknownType), 0),
        }

        let new_ttl = envelope.ttl.unwrap_or(0).saturating_sub(1);
        if new_ttl > 0 {
            (Disposition::Forwarded, new_ttl)
        } else {
            (Disposition::Accepted, 0)
        }
    }

    /// Sign, pre-seed `seen` (blocking our own echo), deliver locally, and
    /// fan out to every linked peer. Returns the new message's id.
    pub async fn broadcast(&self, identity: &Identity, payload: serde_json::Value, link_layer: &crate::link::LinkLayer) -> String {
        let mut envelope = self.sign(identity, payload);
        envelope.ttl = Some(self.initial_ttl);

        self.seen.lock().await.insert(envelope.msg_id.clone());
        self.dispatch.dispatch(&envelope);
        link_layer.broadcast(&envelope).await;

        envelope.msg_id
    }

    pub async fn seen_len(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn counters(&self) -> GossipCounters {
        self.counters.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDispatch(Arc<AtomicUsize>);
    impl Dispatch for CountingDispatch {
        fn dispatch(&self, _envelope: &Envelope) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn identity() -> Identity {
        let dir = tempfile::tempdir().unwrap();
        Identity::load_or_create(dir.path().join("profile.json"), "alice").unwrap()
    }

    #[test]
    fn seen_set_evicts_oldest_on_overflow() {
        let mut seen = SeenSet::new(2);
        seen.insert("a".into());
        seen.insert("b".into());
        seen.insert("c".into());
        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
        assert!(seen.contains("c"));
    }

    #[tokio::test]
    async fn handle_drops_bad_signature() {
        let identity = identity();
        let counter = Arc::new(AtomicUsize::new(0));
        let subscribed = Arc::new(Mutex::new(HashSet::from(["#general".to_string()])));
        let gossip = Gossip::new(3, 64, subscribed, CountingDispatch(counter.clone()));

        let mut envelope = gossip.sign(
            &identity,
            serde_json::json!({"type": "HELLO", "channel_id": "#general", "timestamp": "2026-01-01T00:00:00Z"}),
        );
        envelope.ttl = Some(3);
        envelope.signature = "00".repeat(64);

        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let link_layer = crate::link::LinkLayer::new(crate::config::NodeConfig::default(), tx);
        let disposition = gossip.handle(envelope, &link_layer).await;
        assert_eq!(disposition, Disposition::Dropped(DropReason::BadSignature));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handle_drops_unsubscribed_without_seeding_seen() {
        let identity = identity();
        let counter = Arc::new(AtomicUsize::new(0));
        let subscribed = Arc::new(Mutex::new(HashSet::new()));
        let gossip = Gossip::new(3, 64, subscribed.clone(), CountingDispatch(counter.clone()));

        let mut envelope = gossip.sign(
            &identity,
            serde_json::json!({"type": "HELLO", "channel_id": "#secret", "timestamp": "2026-01-01T00:00:00Z"}),
        );
        envelope.ttl = Some(3);

        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let link_layer = crate::link::LinkLayer::new(crate::config::NodeConfig::default(), tx);
        let disposition = gossip.handle(envelope.clone(), &link_layer).await;
        assert_eq!(disposition, Disposition::Dropped(DropReason::NotSubscribed));
        assert_eq!(gossip.seen_len().await, 0);

        // Subscribing afterward must still allow the same msg_id through.
        subscribed.lock().await.insert("#secret".to_string());
        let disposition2 = gossip.handle(envelope, &link_layer).await;
        assert!(matches!(disposition2, Disposition::Accepted | Disposition::Forwarded));
    }

    #[tokio::test]
    async fn handle_drops_duplicates() {
        let identity = identity();
        let counter = Arc::new(AtomicUsize::new(0));
        let subscribed = Arc::new(Mutex::new(HashSet::from(["#general".to_string()])));
        let gossip = Gossip::new(3, 64, subscribed, CountingDispatch(counter.clone()));

        let mut envelope = gossip.sign(
            &identity,
            serde_json::json!({"type": "HELLO", "channel_id": "#general", "timestamp": "2026-01-01T00:00:00Z"}),
        );
        envelope.ttl = Some(3);

        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let link_layer = crate::link::LinkLayer::new(crate::config::NodeConfig::default(), tx);
        let first = gossip.handle(envelope.clone(), &link_layer).await;
        let second = gossip.handle(envelope, &link_layer).await;
        assert!(matches!(first, Disposition::Accepted | Disposition::Forwarded));
        assert_eq!(second, Disposition::Dropped(DropReason::Duplicate));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_zero_is_accepted_not_forwarded() {
        let identity = identity();
        let counter = Arc::new(AtomicUsize::new(0));
        let subscribed = Arc::new(Mutex::new(HashSet::from(["#general".to_string()])));
        let gossip = Gossip::new(3, 64, subscribed, CountingDispatch(counter));

        let mut envelope = gossip.sign(
            &identity,
            serde_json::json!({"type": "HELLO", "channel_id": "#general", "timestamp": "2026-01-01T00:00:00Z"}),
        );
        envelope.ttl = Some(0);

        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let link_layer = crate::link::LinkLayer::new(crate::config::NodeConfig::default(), tx);
        let disposition = gossip.handle(envelope, &link_layer).await;
        assert_eq!(disposition, Disposition::Accepted);
    }

    #[tokio::test]
    async fn ttl_one_is_accepted_but_not_forwarded() {
        // An envelope arriving with ttl=1 still gets dispatched (step 6 is
        // unconditional), but its decremented ttl (0) is not positive, so
        // this node must not forward it on — this is the boundary that
        // makes a line of INITIAL_TTL+1 nodes the exact reach, not +2.
        let identity = identity();
        let counter = Arc::new(AtomicUsize::new(0));
        let subscribed = Arc::new(Mutex::new(HashSet::from(["#general".to_string()])));
        let gossip = Gossip::new(3, 64, subscribed, CountingDispatch(counter.clone()));

        let mut envelope = gossip.sign(
            &identity,
            serde_json::json!({"type": "HELLO", "channel_id": "#general", "timestamp": "2026-01-01T00:00:00Z"}),
        );
        envelope.ttl = Some(1);

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let link_layer = crate::link::LinkLayer::new(crate::config::NodeConfig::default(), tx);
        let disposition = gossip.handle(envelope, &link_layer).await;
        assert_eq!(disposition, Disposition::Accepted);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        // Nothing queued for any peer, since there's no peer link registered
        // and no forward was attempted anyway.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_preseeds_seen_before_self_delivery_completes() {
        let identity = identity();
        let counter = Arc::new(AtomicUsize::new(0));
        let subscribed = Arc::new(Mutex::new(HashSet::from(["#general".to_string()])));
        let gossip = Gossip::new(3, 64, subscribed, CountingDispatch(counter.clone()));

        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let link_layer = crate::link::LinkLayer::new(crate::config::NodeConfig::default(), tx);
        let msg_id = gossip
            .broadcast(
                &identity,
                serde_json::json!({"type": "HELLO", "channel_id": "#general", "timestamp": "2026-01-01T00:00:00Z"}),
                &link_layer,
            )
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(gossip.seen_len().await, 1);
        assert_eq!(msg_id.len(), 16);
    }

    #[tokio::test]
    async fn with_counters_shares_tallies_with_the_caller() {
        let identity = identity();
        let counter = Arc::new(AtomicUsize::new(0));
        let subscribed = Arc::new(Mutex::new(HashSet::from(["#general".to_string()])));
        let shared = Arc::new(Mutex::new(GossipCounters::default()));
        let gossip = Gossip::with_counters(3, 64, subscribed, CountingDispatch(counter), shared.clone());

        let mut envelope = gossip.sign(
            &identity,
            serde_json::json!({"type": "HELLO", "channel_id": "#general", "timestamp": "2026-01-01T00:00:00Z"}),
        );
        envelope.ttl = Some(3);

        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let link_layer = crate::link::LinkLayer::new(crate::config::NodeConfig::default(), tx);
        gossip.handle(envelope, &link_layer).await;

        // A caller outside Gossip::handle (standing in for Node's policy
        // layer) records a drop through the same handle; it must land in
        // the tallies `gossip.counters()` reports.
        shared.lock().await.record_dropped(DropReason::NoChannelKey);

        let counters = gossip.counters().await;
        assert_eq!(counters.forwarded, 1);
        assert_eq!(counters.dropped_no_channel_key, 1);
    }
}
