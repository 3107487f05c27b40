//! Gossip networking: wire envelopes, the transport boundary, counters,
//! and the manager that owns the node's runtime state and background loops.

pub mod manager;
pub mod message;
pub mod stats;
pub mod transport;

pub use manager::{NetworkManager, NetworkStatus};
pub use message::{Envelope, Payload, DEFAULT_TTL};
pub use stats::{MetricsSnapshot, NetworkStats};
pub use transport::{InMemoryHub, InMemoryTransport, Transport};
