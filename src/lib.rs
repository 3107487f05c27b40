//! Peer-to-peer coordination layer for distributed AI inference.
//!
//! Nodes form a gossip mesh with Kademlia-style routing, announce the
//! models they host, and coordinate inference tasks across peers: large
//! models run as layer pipelines over shards, small ones as redundant
//! replicas whose results pass through Byzantine-tolerant consensus.
//!
//! The crate is transport-agnostic (see [`network::Transport`]) and never
//! runs a forward pass itself (see [`inference::InferenceExecutor`]); both
//! boundaries ship with in-process implementations used by the simulation
//! binary and the tests.

pub mod capability;
pub mod config;
pub mod dht;
pub mod errors;
pub mod identity;
pub mod inference;
pub mod model;
pub mod network;
pub mod observability;

pub use capability::{NodeCapability, NodeType};
pub use config::NodeConfig;
pub use errors::{P2pError, Result, TaskError};
pub use identity::NodeId;
pub use inference::{InferenceReport, InferenceTask};
pub use network::{NetworkManager, NetworkStatus};
