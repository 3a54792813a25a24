//! # consensus
//!
//! why: keep the replication core independent of any one consensus engine
//! relations: implemented by the engine (and local::LocalNetwork); driven by overlay, router, transfer
//! what: StateMachine, FsmSnapshot, Consensus, ConsensusFactory, Voter, ActiveConsensus
//!
//! The engine replicates opaque entries and elects leaders; everything the
//! fleet cares about happens in the [`StateMachine`] it drives. The
//! [`Consensus`] handle is what the overlay, router and leadership transfer
//! use to talk back to the engine.

use async_trait::async_trait;
use fleet_core::{LogEntry, Peer, RaftState, Result};
use parking_lot::RwLock;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The state machine driven by committed entries.
///
/// `apply` is called in committed-log order, identically on every replica.
/// `snapshot` and `apply` may run concurrently.
pub trait StateMachine: Send + Sync {
    fn apply(&self, entry: &LogEntry) -> Result<()>;

    /// Capture what `persist` will write; must be cheap.
    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>>;

    /// Replace all state with the contents of a persisted snapshot.
    fn restore(&self, source: &mut dyn Read) -> Result<()>;
}

/// A point-in-time capture produced by [`StateMachine::snapshot`].
pub trait FsmSnapshot: Send {
    fn persist(&self, sink: &mut dyn Write) -> Result<()>;

    /// Called once the engine is done with the snapshot, persisted or not.
    fn release(self: Box<Self>);
}

/// A voting member of the consensus group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voter {
    pub name: String,
    pub addr: SocketAddr,
}

/// Handle to a running consensus instance.
#[async_trait]
pub trait Consensus: Send + Sync {
    fn local(&self) -> &Peer;

    fn state(&self) -> RaftState;

    /// Consensus address of the current leader, if one is known.
    fn leader(&self) -> Option<SocketAddr>;

    /// Leader observations; changes whenever a new leader is elected or lost.
    fn observe(&self) -> watch::Receiver<Option<SocketAddr>>;

    /// Replicate `command` and wait until it is applied locally.
    ///
    /// Errors returned by the state machine's apply surface here.
    async fn apply(&self, command: Vec<u8>, timeout: Duration) -> Result<()>;

    async fn voters(&self) -> Result<Vec<Voter>>;

    async fn add_voter(&self, peer: &Peer) -> Result<()>;

    async fn remove_server(&self, name: &str) -> Result<()>;

    /// Hand leadership to another voter.
    async fn transfer_leadership(&self) -> Result<()>;

    /// Remove this node from the voter set and stop.
    async fn leave(&self) -> Result<()>;

    /// Stop without touching the voter set.
    async fn shutdown(&self) -> Result<()>;
}

/// Starts consensus instances for the overlay.
#[async_trait]
pub trait ConsensusFactory: Send + Sync {
    /// Join (or bootstrap) the group formed by `peers`, driving `fsm`.
    async fn join(&self, local: &Peer, peers: &[Peer], fsm: Arc<dyn StateMachine>) -> Result<Arc<dyn Consensus>>;
}

/// The consensus instance this node currently participates in, if any.
///
/// Set by the overlay on join and cleared on leave; read by every component
/// that needs to reach the engine.
#[derive(Clone, Default)]
pub struct ActiveConsensus {
    inner: Arc<RwLock<Option<Arc<dyn Consensus>>>>,
}

impl ActiveConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<dyn Consensus>> {
        self.inner.read().clone()
    }

    pub fn set(&self, consensus: Option<Arc<dyn Consensus>>) {
        *self.inner.write() = consensus;
    }

    /// true when a running instance reports itself leader
    pub fn is_leader(&self) -> bool {
        self.get().map_or(false, |c| c.state() == RaftState::Leader)
    }

    pub fn leader(&self) -> Option<SocketAddr> {
        self.get().and_then(|c| c.leader())
    }
}
