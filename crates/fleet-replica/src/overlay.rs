//! # overlay
//!
//! why: only the top-N rendezvous candidates should run consensus, and that set changes with membership
//! relations: reads Membership, drives ConsensusFactory/Consensus, notifies RoleObservers (router, replicator)
//! what: pure role transition function, Overlay step/run loop with broadcast + tick wakeups and drain

use crate::config::ReplicaConfig;
use crate::consensus::{ActiveConsensus, Consensus, ConsensusFactory, StateMachine};
use crate::membership::Membership;
use crate::notify::ClusterChange;
use fleet_core::{ConsensusRole, Error, Peer, RaftState, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// ============================================================================
// TRANSITION FUNCTION
// ============================================================================

/// Everything the transition function looks at, gathered before it runs.
#[derive(Debug, Clone, Default)]
pub struct View {
    /// local node is among the top-N candidates
    pub eligible: bool,
    /// a consensus instance is running locally
    pub joined: bool,
    pub raft: RaftState,
    pub candidates: Vec<Peer>,
    /// current voter names; only filled in when leader
    pub voters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    None,
    /// join the group formed by these peers
    Join(Vec<Peer>),
    Leave,
    /// leader only: bring the voter set in line with the candidates
    Reconcile { add: Vec<Peer>, remove: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: ConsensusRole,
    pub action: Action,
}

impl Transition {
    fn to(next: ConsensusRole, action: Action) -> Self {
        Self { next, action }
    }
}

/// Compute the next role and the action that gets there. Performs no I/O.
pub fn transition(current: ConsensusRole, view: &View) -> Transition {
    if !view.eligible {
        let action = if view.joined { Action::Leave } else { Action::None };
        return Transition::to(ConsensusRole::Passive, action);
    }

    if !view.joined {
        return Transition::to(ConsensusRole::Peer, Action::Join(view.candidates.clone()));
    }

    if view.raft == RaftState::Leader {
        let add = view
            .candidates
            .iter()
            .filter(|c| !view.voters.contains(&c.name))
            .cloned()
            .collect();
        let remove = view
            .voters
            .iter()
            .filter(|v| !view.candidates.iter().any(|c| &c.name == *v))
            .cloned()
            .collect();
        return Transition::to(ConsensusRole::Leader, Action::Reconcile { add, remove });
    }

    if current == ConsensusRole::Leader {
        tracing::debug!("stepped down from leader");
    }
    Transition::to(ConsensusRole::Peer, Action::None)
}

// ============================================================================
// OBSERVERS
// ============================================================================

/// Callbacks fired by the overlay loop. Implementations must not block.
pub trait RoleObserver: Send + Sync {
    fn joined(&self, _consensus: &Arc<dyn Consensus>) {}

    fn left(&self) {}

    fn role_changed(&self, _from: ConsensusRole, _to: ConsensusRole) {}

    fn leader_changed(&self, _leader: Option<SocketAddr>) {}
}

// ============================================================================
// OVERLAY LOOP
// ============================================================================

pub struct Overlay {
    membership: Arc<dyn Membership>,
    factory: Arc<dyn ConsensusFactory>,
    fsm: Arc<dyn StateMachine>,
    active: ActiveConsensus,
    change: ClusterChange,
    observers: Vec<Arc<dyn RoleObserver>>,
    tick: Duration,
    leave_timeout: Duration,
    role: Mutex<ConsensusRole>,
    last_leader: Mutex<Option<SocketAddr>>,
}

impl Overlay {
    pub fn new(
        config: &ReplicaConfig,
        membership: Arc<dyn Membership>,
        factory: Arc<dyn ConsensusFactory>,
        fsm: Arc<dyn StateMachine>,
        active: ActiveConsensus,
        change: ClusterChange,
    ) -> Self {
        Self {
            membership,
            factory,
            fsm,
            active,
            change,
            observers: Vec::new(),
            tick: config.tick_interval(),
            leave_timeout: config.leave_timeout(),
            role: Mutex::new(ConsensusRole::Passive),
            last_leader: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RoleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn role(&self) -> ConsensusRole {
        *self.role.lock()
    }

    async fn view(&self, local: &Peer) -> Result<View> {
        let candidates = self.membership.quorum();
        let eligible = candidates.contains(local);

        let mut view = View { eligible, candidates, ..View::default() };
        if let Some(consensus) = self.active.get() {
            view.joined = true;
            view.raft = consensus.state();
            if view.raft == RaftState::Leader {
                view.voters = consensus.voters().await?.into_iter().map(|v| v.name).collect();
            }
        }
        Ok(view)
    }

    /// Evaluate membership once and act on the result.
    pub async fn step(&self) -> Result<ConsensusRole> {
        let local = self.membership.local();
        let current = self.role();
        let view = self.view(&local).await?;
        let Transition { mut next, action } = transition(current, &view);

        match action {
            Action::None => {}
            Action::Join(peers) => {
                tracing::info!(peer = %local.name, candidates = peers.len(), "joining consensus group");
                match self.factory.join(&local, &peers, Arc::clone(&self.fsm)).await {
                    Ok(consensus) => {
                        self.active.set(Some(Arc::clone(&consensus)));
                        for observer in &self.observers {
                            observer.joined(&consensus);
                        }
                        if consensus.state() == RaftState::Leader {
                            next = ConsensusRole::Leader;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = %local.name, error = %e, "join failed, staying passive");
                        next = ConsensusRole::Passive;
                    }
                }
            }
            Action::Leave => {
                tracing::info!(peer = %local.name, "no longer a candidate, leaving consensus group");
                if let Some(consensus) = self.active.get() {
                    match tokio::time::timeout(self.leave_timeout, consensus.leave()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!(error = %e, "leave failed"),
                        Err(_) => tracing::warn!(timeout = ?self.leave_timeout, "leave timed out"),
                    }
                }
                self.active.set(None);
                for observer in &self.observers {
                    observer.left();
                }
            }
            Action::Reconcile { add, remove } => {
                if let Some(consensus) = self.active.get() {
                    self.reconcile_voters(consensus.as_ref(), &local, add, remove).await;
                }
            }
        }

        self.observe_leader();

        if next != current {
            tracing::info!(peer = %local.name, from = %current, to = %next, "consensus role changed");
            *self.role.lock() = next;
            for observer in &self.observers {
                observer.role_changed(current, next);
            }
        }
        Ok(next)
    }

    async fn reconcile_voters(&self, consensus: &dyn Consensus, local: &Peer, add: Vec<Peer>, remove: Vec<String>) {
        for peer in add {
            match consensus.add_voter(&peer).await {
                Ok(()) => tracing::info!(voter = %peer.name, "voter added"),
                Err(e) => tracing::warn!(voter = %peer.name, error = %e, "adding voter failed"),
            }
        }
        for name in remove.into_iter().filter(|n| *n != local.name) {
            match consensus.remove_server(&name).await {
                Ok(()) => tracing::info!(voter = %name, "voter removed"),
                Err(e) => tracing::warn!(voter = %name, error = %e, "removing voter failed"),
            }
        }
    }

    fn observe_leader(&self) {
        let leader = self.active.leader();
        let changed = {
            let mut last = self.last_leader.lock();
            let changed = *last != leader;
            *last = leader;
            changed
        };
        if changed {
            tracing::debug!(leader = ?leader, "leader observed");
            for observer in &self.observers {
                observer.leader_changed(leader);
            }
        }
    }

    /// Step on every cluster change, leader change or tick until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut waiter = self.change.subscribe();
        loop {
            if let Err(e) = self.step().await {
                tracing::warn!(error = %e, "overlay step failed");
            }

            let leader_rx = self.active.get().map(|c| c.observe());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = waiter.wait(self.tick) => {}
                _ = leader_change(leader_rx) => {}
            }
        }
        self.drain().await;
    }

    /// Stop participating without touching the voter set.
    pub async fn drain(&self) {
        self.change.broadcast();

        if let Some(consensus) = self.active.get() {
            let outcome = tokio::time::timeout(self.leave_timeout, consensus.shutdown()).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "consensus shutdown failed"),
                Err(_) => tracing::warn!(error = %Error::Timeout(self.leave_timeout), "consensus shutdown"),
            }
            self.active.set(None);
            for observer in &self.observers {
                observer.left();
            }
        }

        let previous = std::mem::replace(&mut *self.role.lock(), ConsensusRole::Passive);
        if previous != ConsensusRole::Passive {
            for observer in &self.observers {
                observer.role_changed(previous, ConsensusRole::Passive);
            }
        }
        tracing::info!(peer = %self.membership.local().name, "overlay drained");
    }
}

async fn leader_change(rx: Option<watch::Receiver<Option<SocketAddr>>>) {
    match rx {
        Some(mut rx) => {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(names: &[&str]) -> Vec<Peer> {
        names.iter().map(|n| Peer::loopback(*n)).collect()
    }

    #[test]
    fn ineligible_nodes_stay_passive() {
        let view = View { eligible: false, joined: false, ..View::default() };
        let t = transition(ConsensusRole::Passive, &view);
        assert_eq!(t, Transition { next: ConsensusRole::Passive, action: Action::None });
    }

    #[test]
    fn eligible_nodes_join_the_candidates() {
        let view = View { eligible: true, candidates: peers(&["a", "b"]), ..View::default() };
        let t = transition(ConsensusRole::Passive, &view);
        assert_eq!(t.next, ConsensusRole::Peer);
        assert_eq!(t.action, Action::Join(peers(&["a", "b"])));
    }

    #[test]
    fn leaders_that_drop_out_leave() {
        let view = View { eligible: false, joined: true, raft: RaftState::Leader, ..View::default() };
        let t = transition(ConsensusRole::Leader, &view);
        assert_eq!(t, Transition { next: ConsensusRole::Passive, action: Action::Leave });
    }

    #[test]
    fn leader_reconciles_voters() {
        let view = View {
            eligible: true,
            joined: true,
            raft: RaftState::Leader,
            candidates: peers(&["a", "b", "c"]),
            voters: vec!["a".into(), "b".into(), "z".into()],
        };
        let t = transition(ConsensusRole::Leader, &view);
        assert_eq!(t.next, ConsensusRole::Leader);
        assert_eq!(t.action, Action::Reconcile { add: peers(&["c"]), remove: vec!["z".into()] });
    }

    #[test]
    fn followers_hold_the_peer_role() {
        let view = View { eligible: true, joined: true, raft: RaftState::Follower, ..View::default() };
        assert_eq!(transition(ConsensusRole::Leader, &view).next, ConsensusRole::Peer);
        assert_eq!(transition(ConsensusRole::Peer, &view).action, Action::None);
    }
}
