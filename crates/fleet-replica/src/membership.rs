//! # membership
//!
//! why: every node must pick the same consensus candidates from the same peer list
//! relations: read by overlay, transfer and status; ReplicaNode narrows it with the configured seats
//! what: Membership, rendezvous selection, SeatedMembership, StaticMembership
//!
//! The gossip layer itself lives elsewhere; the core only needs the narrow
//! [`Membership`] view.

use crate::config::ReplicaConfig;
use crate::notify::ClusterChange;
use fleet_core::Peer;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;

/// Read-only view of cluster membership.
pub trait Membership: Send + Sync {
    /// This node.
    fn local(&self) -> Peer;

    /// Every known peer, including the local one.
    fn peers(&self) -> Vec<Peer>;

    /// The peers currently eligible for consensus seats; everyone unless narrowed.
    fn quorum(&self) -> Vec<Peer> {
        self.peers()
    }

    /// The single highest ranked peer for `key`.
    fn get(&self, key: &[u8]) -> Option<Peer> {
        self.get_n(1, key).into_iter().next()
    }

    /// The `n` highest ranked peers for `key`.
    fn get_n(&self, n: usize, key: &[u8]) -> Vec<Peer> {
        rendezvous::top_n(key, &self.peers(), n)
    }
}

/// Find the peer whose consensus transport listens on `addr`.
pub fn find_by_raft_addr(peers: &[Peer], addr: SocketAddr) -> Option<Peer> {
    peers.iter().find(|p| p.raft_addr() == addr).cloned()
}

pub mod rendezvous {
    //! Highest-random-weight selection.

    use super::*;

    /// weight of `peer` for `key`; only depends on the key and the peer name
    pub fn weight(key: &[u8], peer: &Peer) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(peer.name.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }

    /// the `n` heaviest peers for `key`, heaviest first; names break ties
    pub fn top_n(key: &[u8], peers: &[Peer], n: usize) -> Vec<Peer> {
        let mut ranked: Vec<(u64, &Peer)> = peers.iter().map(|p| (weight(key, p), p)).collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
        ranked.dedup_by(|a, b| a.1 == b.1);
        ranked.into_iter().take(n).map(|(_, p)| p.clone()).collect()
    }
}

/// Membership narrowed to the top `quorum_size` peers for the selection key.
pub struct SeatedMembership {
    inner: Arc<dyn Membership>,
    size: usize,
    key: Vec<u8>,
}

impl SeatedMembership {
    pub fn new(inner: Arc<dyn Membership>, config: &ReplicaConfig) -> Self {
        Self { inner, size: config.quorum_size, key: config.key().to_vec() }
    }
}

impl Membership for SeatedMembership {
    fn local(&self) -> Peer {
        self.inner.local()
    }

    fn peers(&self) -> Vec<Peer> {
        self.inner.peers()
    }

    fn quorum(&self) -> Vec<Peer> {
        self.inner.get_n(self.size, &self.key)
    }

    fn get_n(&self, n: usize, key: &[u8]) -> Vec<Peer> {
        self.inner.get_n(n, key)
    }
}

/// In-memory membership that is updated explicitly.
///
/// Every mutation broadcasts on the cluster-change channel, the same way the
/// gossip layer does when it observes joins, leaves and updates.
pub struct StaticMembership {
    local: Peer,
    peers: RwLock<Vec<Peer>>,
    change: ClusterChange,
}

impl StaticMembership {
    pub fn new(local: Peer, peers: Vec<Peer>, change: ClusterChange) -> Self {
        let mut all = peers;
        if !all.contains(&local) {
            all.push(local.clone());
        }

        Self { local, peers: RwLock::new(all), change }
    }

    pub fn join(&self, peer: Peer) {
        {
            let mut peers = self.peers.write();
            if peers.contains(&peer) {
                return;
            }
            peers.push(peer.clone());
        }
        tracing::debug!(peer = %peer.name, "membership join");
        self.change.broadcast();
    }

    pub fn leave(&self, name: &str) {
        let removed = {
            let mut peers = self.peers.write();
            let before = peers.len();
            peers.retain(|p| p.name != name || p.name == self.local.name);
            before != peers.len()
        };
        if removed {
            tracing::debug!(peer = %name, "membership leave");
            self.change.broadcast();
        }
    }

    pub fn update(&self, peer: Peer) {
        {
            let mut peers = self.peers.write();
            match peers.iter_mut().find(|p| **p == peer) {
                Some(existing) => *existing = peer.clone(),
                None => peers.push(peer.clone()),
            }
        }
        tracing::debug!(peer = %peer.name, "membership update");
        self.change.broadcast();
    }

    pub fn change(&self) -> &ClusterChange {
        &self.change
    }
}

impl Membership for StaticMembership {
    fn local(&self) -> Peer {
        self.local.clone()
    }

    fn peers(&self) -> Vec<Peer> {
        self.peers.read().clone()
    }
}
