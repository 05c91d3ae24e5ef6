//! Wire envelope shape and the canonicalization rule used for signing.
//!
//! A frame on the wire is one JSON object terminated by `\n` (see `link`).
//! Everything about *what* that object contains lives here; how it gets
//! read off a socket does not.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The unit gossiped between nodes. `ttl` and the three envelope-level
/// fields (`msg_id`, `sender_id`, `signature`) sit outside the signed
/// region — only `payload` is signed, so a forwarder may decrement `ttl`
/// without invalidating the signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: String,
    pub sender_id: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u8>,
    pub payload: Value,
}

/// Payload `type` discriminants named on the wire.
pub mod payload_type {
    pub const CHAT_MESSAGE: &str = "chat_message";
    pub const HELLO: &str = "HELLO";
    pub const INVITE: &str = "INVITE";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub channel_id: String,
    pub timestamp: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_encrypted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub channel_id: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitePayload {
    #[serde(rename = "type")]
    pub kind: String,
    /// The channel this envelope is gossiped on — always `#general`
    /// (INVITEs are public so non-targets still relay them). The private
    /// channel being invited to travels separately in `invite_channel_id`,
    /// since gossip filtering keys off this field and a non-member is
    /// never subscribed to the private channel itself.
    pub channel_id: String,
    pub timestamp: String,
    pub target_node_id: String,
    pub invite_channel_id: String,
    pub channel_name: String,
    pub channel_type: String,
    pub encrypted_key: String,
}

/// Serialize `payload` with keys sorted lexicographically and no
/// whitespace, producing the exact bytes that get signed and verified.
/// `serde_json::Value`'s `Map` is a `BTreeMap` under the `preserve_order`
/// feature being *off* (the default), so `to_string` already sorts keys;
/// this function exists so the rule has one name and one call site rather
/// than being assumed at each signer/verifier.
pub fn canonicalize(payload: &Value) -> Vec<u8> {
    let sorted = sort_keys(payload);
    serde_json::to_vec(&sorted).expect("Value serialization does not fail")
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Extract `payload.channel_id`, the one field every payload type carries
/// and that gossip filtering needs before it trusts anything else about the
/// message.
pub fn channel_id_of(payload: &Value) -> Option<&str> {
    payload.get("channel_id")?.as_str()
}

/// Extract `payload.type`.
pub fn type_of(payload: &Value) -> Option<&str> {
    payload.get("type")?.as_str()
}
