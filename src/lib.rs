//! Peer-to-peer local-network chat mesh.
//!
//! A node is a single cryptographic identity (`identity`) participating in
//! a gossip mesh (`gossip`) over TCP links (`link`) with peers found by LAN
//! discovery (`discovery`). Channels are public or end-to-end-encrypted
//! private groups (`crypto`), and history is kept in a local SQLite store
//! (`store`). `node` wires all of these into the policy layer applications
//! actually talk to.

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod link;
pub mod node;
pub mod store;
pub mod wire;

pub use config::NodeConfig;
pub use error::{Disposition, DropReason, NodeError};
pub use identity::Identity;
pub use node::{ChannelKind, Node, NodeEvent, NodeStats};

/// Install a `tracing` subscriber reading `RUST_LOG` (default `info`). Call
/// once at process startup; a CLI or test harness that wants its own
/// subscriber can skip this.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
