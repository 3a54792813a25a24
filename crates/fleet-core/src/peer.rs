//! # peer
//!
//! why: identify a cluster member and the endpoints its subsystems listen on
//! relations: carried as the origin of every message, selected by membership views
//! what: Peer, PeerStatus, Capabilities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Lifecycle status advertised by a peer over gossip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PeerStatus {
    /// joined gossip but has not finished bootstrapping
    #[default]
    Joining,
    /// serving traffic
    Ready,
    /// announced its departure
    Leaving,
}

/// Capability bits a peer advertises (encoding is owned by the gossip layer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Capabilities(pub u32);

impl Capabilities {
    /// peer may be selected into the consensus group
    pub const CONSENSUS: Capabilities = Capabilities(1);
    /// peer accepts deployments
    pub const DEPLOY: Capabilities = Capabilities(1 << 1);

    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }
}

/// A single member of the fleet
///
/// peers are immutable once constructed. two peers are the same peer when
/// their name and address match, regardless of status or ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub ip: IpAddr,
    pub raft_port: u16,
    pub rpc_port: u16,
    pub swim_port: u16,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub status: PeerStatus,
}

impl Peer {
    /// Create a ready peer with both consensus and deploy capabilities
    pub fn new(name: impl Into<String>, ip: IpAddr, raft_port: u16, rpc_port: u16, swim_port: u16) -> Self {
        Self {
            name: name.into(),
            ip,
            raft_port,
            rpc_port,
            swim_port,
            capabilities: Capabilities::CONSENSUS.with(Capabilities::DEPLOY),
            status: PeerStatus::Ready,
        }
    }

    /// Loopback peer with the default port layout, handy for local clusters
    pub fn loopback(name: impl Into<String>) -> Self {
        Self::new(name, IpAddr::V4(Ipv4Addr::LOCALHOST), 2001, 2000, 2002)
    }

    pub fn with_status(mut self, status: PeerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// address of the consensus transport
    pub fn raft_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.raft_port)
    }

    /// address of the rpc service
    pub fn rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.rpc_port)
    }

    /// address of the gossip transport
    pub fn swim_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.swim_port)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.ip == other.ip
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.ip.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_ports_and_status() {
        let a = Peer::loopback("node-1");
        let mut b = Peer::loopback("node-1").with_status(PeerStatus::Leaving);
        b.rpc_port = 9999;

        assert_eq!(a, b);
        assert_ne!(a, Peer::loopback("node-2"));
    }

    #[test]
    fn capabilities_compose() {
        let caps = Capabilities::default().with(Capabilities::DEPLOY);
        assert!(caps.contains(Capabilities::DEPLOY));
        assert!(!caps.contains(Capabilities::CONSENSUS));
    }
}
