use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::RoutingId;

pub const SUPERNODE_PREFIX: &str = "node-";

/// Peer address string: `[node-]<identity>-<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddr(String);

impl PeerAddr {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_supernode(&self) -> bool {
        self.0.starts_with(SUPERNODE_PREFIX)
    }

    /// Identity key embedded in the address, without role prefix and
    /// session suffix. Balances are keyed by this value.
    pub fn identity(&self) -> &str {
        let body = self.0.strip_prefix(SUPERNODE_PREFIX).unwrap_or(&self.0);
        match body.rsplit_once('-') {
            Some((identity, _suffix)) if !identity.is_empty() => identity,
            _ => body,
        }
    }

    pub fn routing_id(&self) -> RoutingId {
        RoutingId::for_key(&self.0)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddr {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

/// How a channel to a peer came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supernode_prefix_and_identity() {
        let node = PeerAddr::from("node-0a1b2c3d4e5f6071-AbC12");
        assert!(node.is_supernode());
        assert_eq!(node.identity(), "0a1b2c3d4e5f6071");

        let peer = PeerAddr::from("0a1b2c3d4e5f6071-xYz99");
        assert!(!peer.is_supernode());
        assert_eq!(peer.identity(), "0a1b2c3d4e5f6071");
    }

    #[test]
    fn identity_without_suffix_is_whole_body() {
        assert_eq!(PeerAddr::from("node-plain").identity(), "plain");
        assert_eq!(PeerAddr::from("plain").identity(), "plain");
    }

    #[test]
    fn peer_addr_cbor_roundtrip() {
        let addr = PeerAddr::from("node-abc-12345");
        let encoded = crate::cbor::to_vec(&addr).expect("encode peer addr");
        let decoded: PeerAddr = crate::cbor::from_slice(&encoded).expect("decode peer addr");
        assert_eq!(decoded, addr);
    }
}
