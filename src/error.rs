//! Top-level and per-disposition error types.
//!
//! Each component owns a `thiserror` enum of its own (see `identity`,
//! `crypto`, `store`, `link`); this module only composes the subset that can
//! legitimately abort startup (`NodeError`) and the gossip engine's
//! disposition enum, which is not an error type in the `Result` sense but
//! the typed outcome of `Gossip::handle`.

use thiserror::Error;

use crate::{crypto::CryptoError, identity::IdentityError, link::LinkError, store::StoreError};

/// Errors that can abort node startup. Everything else is logged and
/// swallowed at the component boundary where it occurs — a peer's bad
/// behavior, a malformed frame, or a failed decrypt never reaches here.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("link layer error: {0}")]
    Link(#[from] LinkError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("channel {0:?} already exists")]
    ChannelExists(String),

    #[error("channel {0:?} does not exist")]
    ChannelNotFound(String),

    #[error("invite rejected: caller is not the owner of {0:?}")]
    NotOwner(String),

    #[error("invalid channel id {0:?}")]
    InvalidChannelId(String),

    #[error("no channel key held for private channel {0:?}; cannot send without downgrading to plaintext")]
    NoChannelKey(String),
}

/// Why an inbound frame was dropped instead of accepted or forwarded.
///
/// This is surfaced for observability and tests only — never transmitted to
/// peers and never used to decide retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    BadSignature,
    NotSubscribed,
    Duplicate,
    NoChannelKey,
    DecryptFailure,
    UnknownType,
    InvalidEncoding,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DropReason::BadSignature => "bad_signature",
            DropReason::NotSubscribed => "not_subscribed",
            DropReason::Duplicate => "duplicate",
            DropReason::NoChannelKey => "no_channel_key",
            DropReason::DecryptFailure => "decrypt_failure",
            DropReason::UnknownType => "unknown_type",
            DropReason::InvalidEncoding => "invalid_encoding",
        };
        f.write_str(s)
    }
}

/// Outcome of `Gossip::handle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Accepted locally; `ttl` did not permit forwarding.
    Accepted,
    /// Accepted locally and forwarded to other peers.
    Forwarded,
    /// Not accepted, for the given reason.
    Dropped(DropReason),
}
