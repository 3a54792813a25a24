//! # dispatch
//!
//! why: writes must go through the consensus leader, wherever the caller happens to be
//! relations: used by the replicator, the service surface and the authority bootstrap
//! what: Dispatcher seam and Router (leader apply, follower proxy with a cached leader client)

use crate::consensus::ActiveConsensus;
use crate::membership::{self, Membership};
use crate::overlay::RoleObserver;
use crate::rpc::{Client, Dialer};
use async_trait::async_trait;
use fleet_core::{Error, Message, RaftState, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Replicates messages through the consensus log.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, messages: Vec<Message>) -> Result<()>;
}

/// Routes dispatches to the leader.
///
/// There is no retry here; callers decide whether to try another peer.
pub struct Router {
    active: ActiveConsensus,
    membership: Arc<dyn Membership>,
    dialer: Arc<dyn Dialer>,
    apply_timeout: Duration,
    cached: Mutex<Option<(SocketAddr, Arc<dyn Client>)>>,
}

impl Router {
    pub fn new(
        active: ActiveConsensus,
        membership: Arc<dyn Membership>,
        dialer: Arc<dyn Dialer>,
        apply_timeout: Duration,
    ) -> Self {
        Self { active, membership, dialer, apply_timeout, cached: Mutex::new(None) }
    }

    /// address of the leader the cached client points at
    pub fn cached_leader(&self) -> Option<SocketAddr> {
        self.cached.lock().as_ref().map(|(addr, _)| *addr)
    }

    /// drop the cached leader client, closing it in the background
    pub fn invalidate(&self) {
        let Some((addr, client)) = self.cached.lock().take() else {
            return;
        };

        tracing::debug!(leader = %addr, "leader connection invalidated");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = client.close().await {
                    tracing::debug!(error = %e, "closing leader connection");
                }
            });
        }
    }

    async fn leader_client(&self, addr: SocketAddr) -> Result<Arc<dyn Client>> {
        {
            let cached = self.cached.lock();
            if let Some((cached_addr, client)) = cached.as_ref() {
                if *cached_addr == addr {
                    return Ok(Arc::clone(client));
                }
            }
        }

        let peer = membership::find_by_raft_addr(&self.membership.peers(), addr).ok_or(Error::NoLeader)?;
        let client = self.dialer.dial(&peer).await?;
        tracing::debug!(leader = %peer.name, "dialed leader");

        let previous = self.cached.lock().replace((addr, Arc::clone(&client)));
        if let Some((_, stale)) = previous {
            if let Err(e) = stale.close().await {
                tracing::debug!(error = %e, "closing stale leader connection");
            }
        }
        Ok(client)
    }
}

#[async_trait]
impl Dispatcher for Router {
    async fn dispatch(&self, messages: Vec<Message>) -> Result<()> {
        let consensus = self.active.get().ok_or(Error::NotMember)?;

        if consensus.state() == RaftState::Leader {
            for message in &messages {
                consensus.apply(message.encode()?, self.apply_timeout).await?;
            }
            return Ok(());
        }

        let leader = consensus.leader().ok_or(Error::NoLeader)?;
        let client = self.leader_client(leader).await?;
        tracing::debug!(leader = %leader, messages = messages.len(), "proxying dispatch to leader");
        client.dispatch(messages).await
    }
}

impl RoleObserver for Router {
    fn left(&self) {
        self.invalidate();
    }

    fn leader_changed(&self, leader: Option<SocketAddr>) {
        if self.cached_leader() != leader {
            self.invalidate();
        }
    }
}
