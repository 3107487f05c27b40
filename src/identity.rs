use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Opaque node identifier, unique network-wide.
///
/// The identifier itself is free-form (a hostname hash, a UUID, anything
/// stable); routing never inspects the string. The DHT works on the
/// SHA-256-derived 64-bit [`key`](NodeId::key) instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        NodeId(format!("node-{}", &raw[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 64-bit DHT key: the first 8 bytes of the SHA-256 of the identifier.
    pub fn key(&self) -> u64 {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(buf)
    }

    /// XOR distance between two identifiers.
    ///
    /// Symmetric, and zero only when the two keys coincide.
    pub fn distance(&self, other: &NodeId) -> u64 {
        self.key() ^ other.key()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_distance_to_self_is_zero() {
        let id = NodeId::new("alpha");
        assert_eq!(id.distance(&id), 0);
    }

    #[test]
    fn test_distance_nonzero_for_distinct_ids() {
        let a = NodeId::new("alpha");
        let b = NodeId::new("beta");
        assert_ne!(a.distance(&b), 0);
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = NodeId::new("alpha");
        let first = a.key();
        for _ in 0..100 {
            assert_eq!(a.key(), first);
        }
    }

    #[quickcheck]
    fn prop_distance_symmetry(a: String, b: String) -> bool {
        let a = NodeId::new(a);
        let b = NodeId::new(b);
        a.distance(&b) == b.distance(&a)
    }

    #[test]
    fn test_serde_transparent() {
        let id = NodeId::new("worker-3");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"worker-3\"");

        let decoded: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, id);
    }

    #[test]
    fn test_random_ids_are_unique() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_ne!(a, b);
    }
}
