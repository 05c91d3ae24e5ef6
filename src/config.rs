//! Tunables named by the protocol design: initial TTL, seen-set capacity,
//! link timeouts, frame size cap. Loading these from a file or CLI is out of
//! scope here — this struct is the surface a CLI or config loader populates.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Hop count attached to a freshly broadcast envelope.
    pub initial_ttl: u8,
    /// Minimum size of the in-memory seen-id FIFO.
    pub seen_capacity: usize,
    /// Hard cap on a single outbound dial attempt.
    pub dial_timeout: Duration,
    /// Idle cap on a single frame read; exceeding it closes the link.
    pub frame_read_timeout: Duration,
    /// Maximum size, in bytes, of one wire frame (including the trailing
    /// newline).
    pub max_frame_bytes: usize,
    /// Bounded depth of the per-peer outbound send queue.
    pub send_queue_capacity: usize,
    /// Username recorded in the identity profile on first run.
    pub username: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            initial_ttl: 3,
            seen_capacity: 1024,
            dial_timeout: Duration::from_secs(5),
            frame_read_timeout: Duration::from_secs(30),
            max_frame_bytes: 4096,
            send_queue_capacity: 64,
            username: "anonymous".to_string(),
        }
    }
}
