//! # local
//!
//! why: run the replication core without a network, for simulations and tests
//! relations: implements ConsensusFactory/Consensus, Dialer/Client and ArchiveStorage in-process
//! what: LocalNetwork (one shared log, explicit elect/crash/snapshot/restart), LocalDialer, MemoryArchives
//!
//! The group commits synchronously: an apply appends to the shared log and
//! runs every online member's state machine before returning. State machines
//! are called with the group locked, so they must never call back into the
//! group synchronously; `Consensus::state` and `leader` only read the
//! member's watch channel and are safe.

use crate::consensus::{Consensus, ConsensusFactory, StateMachine, Voter};
use crate::deploy::Info;
use crate::rpc::{Client, Dialer};
use crate::service::{ArchiveStorage, Call, ReplicaService, Uploader};
use async_trait::async_trait;
use fleet_core::{Capabilities, Code, Error, LogEntry, Message, Peer, RaftState, Result};
use fleet_storage::{InMemorySnapshotStore, SnapshotMeta, SnapshotStore};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// GROUP STATE
// ============================================================================

struct Member {
    peer: Peer,
    fsm: Arc<dyn StateMachine>,
    /// number of log entries applied
    applied: usize,
    online: bool,
    down: Arc<AtomicBool>,
    snapshots: InMemorySnapshotStore,
    leader_tx: watch::Sender<Option<SocketAddr>>,
}

impl Member {
    /// apply every pending entry; the result is the last entry's
    fn catch_up(&mut self, log: &[LogEntry]) -> Result<()> {
        let mut last = Ok(());
        while self.applied < log.len() {
            let entry = &log[self.applied];
            self.applied += 1;
            last = self.fsm.apply(entry);
            if let Err(e) = &last {
                tracing::debug!(member = %self.peer.name, index = entry.index, error = %e, "entry rejected by state machine");
            }
        }
        last
    }
}

#[derive(Default)]
struct Group {
    term: u64,
    log: Vec<LogEntry>,
    voters: Vec<Peer>,
    leader: Option<String>,
    members: BTreeMap<String, Member>,
}

impl Group {
    fn leader_addr(&self) -> Option<SocketAddr> {
        let name = self.leader.as_ref()?;
        self.members.get(name).map(|m| m.peer.raft_addr())
    }

    fn announce(&self) {
        let addr = self.leader_addr();
        for member in self.members.values() {
            member.leader_tx.send_replace(addr);
        }
    }

    fn is_online(&self, name: &str) -> bool {
        self.members.get(name).map_or(false, |m| m.online)
    }

    fn elect(&mut self, name: &str) -> Result<()> {
        let voter = self.voters.iter().any(|v| v.name == name);
        if !voter || !self.is_online(name) {
            return Err(Error::Internal(format!("{} is not an online voter", name)));
        }

        self.term += 1;
        self.leader = Some(name.to_string());
        tracing::info!(leader = name, term = self.term, "leader elected");
        self.announce();
        Ok(())
    }

    /// elect the first online voter other than `excluding`
    fn failover(&mut self, excluding: Option<&str>) {
        self.leader = None;
        let next = self
            .voters
            .iter()
            .map(|v| v.name.clone())
            .find(|n| Some(n.as_str()) != excluding && self.is_online(n));

        match next {
            Some(name) => {
                if let Err(e) = self.elect(&name) {
                    tracing::warn!(error = %e, "failover election failed");
                }
            }
            None => {
                tracing::warn!("no voter available for election");
                self.announce();
            }
        }
    }

    fn catch_up(&mut self, name: &str) {
        let Group { log, members, .. } = self;
        if let Some(member) = members.get_mut(name) {
            // rejections were already reported by the member
            let _ = member.catch_up(log);
        }
    }

    fn commit(&mut self, leader: &str, command: Vec<u8>) -> Result<()> {
        let index = self.log.len() as u64 + 1;
        self.log.push(LogEntry::new(self.term, index, command));

        let mut outcome = Ok(());
        let Group { log, members, .. } = self;
        for (name, member) in members.iter_mut() {
            if !member.online {
                continue;
            }
            let result = member.catch_up(log);
            if name == leader {
                outcome = result;
            }
        }
        outcome
    }

    fn take_offline(&mut self, name: &str) {
        if let Some(member) = self.members.get_mut(name) {
            member.online = false;
            member.down.store(true, Ordering::SeqCst);
        }
        if self.leader.as_deref() == Some(name) {
            self.failover(Some(name));
        }
    }
}

fn same_fsm(a: &Arc<dyn StateMachine>, b: &Arc<dyn StateMachine>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// ============================================================================
// NETWORK
// ============================================================================

/// An in-process consensus group shared by every node of a simulation.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    group: Arc<Mutex<Group>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, group: &Group, name: &str) -> Result<Arc<LocalNode>> {
        let member = group
            .members
            .get(name)
            .ok_or_else(|| Error::Internal(format!("{} never joined", name)))?;

        Ok(Arc::new(LocalNode {
            peer: member.peer.clone(),
            group: Arc::clone(&self.group),
            leader_rx: member.leader_tx.subscribe(),
            down: Arc::clone(&member.down),
        }))
    }

    fn attach(&self, local: &Peer, peers: &[Peer], fsm: Arc<dyn StateMachine>) -> Result<Arc<LocalNode>> {
        let mut guard = self.group.lock();
        let group = &mut *guard;

        if group.voters.is_empty() {
            group.voters = peers
                .iter()
                .filter(|p| p.capabilities.contains(Capabilities::CONSENSUS))
                .cloned()
                .collect();
            if !group.voters.contains(local) {
                group.voters.push(local.clone());
            }
            tracing::info!(voters = group.voters.len(), "consensus group bootstrapped");
        }

        let down = Arc::new(AtomicBool::new(false));
        match group.members.get_mut(&local.name) {
            Some(member) => {
                if !same_fsm(&member.fsm, &fsm) {
                    member.fsm = fsm;
                    member.applied = 0;
                }
                member.peer = local.clone();
                member.online = true;
                member.down = down;
            }
            None => {
                let (leader_tx, _) = watch::channel(None);
                group.members.insert(
                    local.name.clone(),
                    Member {
                        peer: local.clone(),
                        fsm,
                        applied: 0,
                        online: true,
                        down,
                        snapshots: InMemorySnapshotStore::new(),
                        leader_tx,
                    },
                );
            }
        }

        group.catch_up(&local.name);
        if group.leader.is_none() {
            group.failover(None);
        } else {
            group.announce();
        }
        self.handle(group, &local.name)
    }

    /// Make `name` leader; it must be an online voter.
    pub fn elect(&self, name: &str) -> Result<()> {
        self.group.lock().elect(name)
    }

    /// Stop `name` abruptly; a leader is replaced by the next online voter.
    pub fn crash(&self, name: &str) {
        tracing::info!(member = name, "member crashed");
        self.group.lock().take_offline(name);
    }

    /// Snapshot `name`'s state machine into its snapshot store.
    pub fn snapshot(&self, name: &str) -> Result<SnapshotMeta> {
        let group = self.group.lock();
        let member = group
            .members
            .get(name)
            .ok_or_else(|| Error::Internal(format!("{} never joined", name)))?;

        let snapshot = member.fsm.snapshot()?;
        let mut buf = Vec::new();
        let persisted = snapshot.persist(&mut buf);
        snapshot.release();
        persisted?;

        let mut sink = member.snapshots.create(member.applied as u64, group.term)?;
        if let Err(e) = sink.write_all(&buf) {
            sink.cancel()?;
            return Err(e.into());
        }
        let meta = sink.close()?;
        tracing::info!(member = name, index = meta.index, bytes = meta.size, "snapshot persisted");
        Ok(meta)
    }

    /// Bring `name` back with a fresh state machine: restore its latest
    /// snapshot, then replay the log after it.
    pub fn restart(&self, name: &str, fsm: Arc<dyn StateMachine>) -> Result<Arc<dyn Consensus>> {
        let mut guard = self.group.lock();
        let group = &mut *guard;
        let member = group
            .members
            .get_mut(name)
            .ok_or_else(|| Error::Internal(format!("{} never joined", name)))?;

        let applied = match member.snapshots.latest()? {
            Some((meta, mut reader)) => {
                fsm.restore(&mut *reader)?;
                meta.index as usize
            }
            None => 0,
        };

        member.fsm = fsm;
        member.applied = applied;
        member.online = true;
        member.down = Arc::new(AtomicBool::new(false));
        tracing::info!(member = name, from = applied, "member restarted");

        group.catch_up(name);
        if group.leader.is_none() {
            group.failover(None);
        } else {
            group.announce();
        }
        let node: Arc<dyn Consensus> = self.handle(group, name)?;
        Ok(node)
    }

    pub fn leader_name(&self) -> Option<String> {
        self.group.lock().leader.clone()
    }

    pub fn voters(&self) -> Vec<String> {
        self.group.lock().voters.iter().map(|v| v.name.clone()).collect()
    }

    pub fn log_len(&self) -> usize {
        self.group.lock().log.len()
    }

    /// entries applied by `name`
    pub fn applied(&self, name: &str) -> Option<usize> {
        self.group.lock().members.get(name).map(|m| m.applied)
    }
}

#[async_trait]
impl ConsensusFactory for LocalNetwork {
    async fn join(&self, local: &Peer, peers: &[Peer], fsm: Arc<dyn StateMachine>) -> Result<Arc<dyn Consensus>> {
        let node: Arc<dyn Consensus> = self.attach(local, peers, fsm)?;
        Ok(node)
    }
}

// ============================================================================
// NODE HANDLE
// ============================================================================

pub struct LocalNode {
    peer: Peer,
    group: Arc<Mutex<Group>>,
    leader_rx: watch::Receiver<Option<SocketAddr>>,
    down: Arc<AtomicBool>,
}

impl LocalNode {
    fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    /// run `f` with the group locked, requiring this node to be leader
    fn as_leader<T>(&self, f: impl FnOnce(&mut Group, &str) -> Result<T>) -> Result<T> {
        if self.is_down() {
            return Err(Error::NotMember);
        }
        let mut group = self.group.lock();
        if group.leader.as_deref() != Some(self.peer.name.as_str()) {
            return Err(Error::NoLeader);
        }
        f(&mut *group, &self.peer.name)
    }
}

#[async_trait]
impl Consensus for LocalNode {
    fn local(&self) -> &Peer {
        &self.peer
    }

    fn state(&self) -> RaftState {
        if self.is_down() {
            return RaftState::Shutdown;
        }
        if *self.leader_rx.borrow() == Some(self.peer.raft_addr()) {
            RaftState::Leader
        } else {
            RaftState::Follower
        }
    }

    fn leader(&self) -> Option<SocketAddr> {
        if self.is_down() {
            return None;
        }
        *self.leader_rx.borrow()
    }

    fn observe(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.leader_rx.clone()
    }

    async fn apply(&self, command: Vec<u8>, _timeout: Duration) -> Result<()> {
        self.as_leader(|group, name| group.commit(name, command))
    }

    async fn voters(&self) -> Result<Vec<Voter>> {
        if self.is_down() {
            return Err(Error::NotMember);
        }
        let group = self.group.lock();
        Ok(group
            .voters
            .iter()
            .map(|v| Voter { name: v.name.clone(), addr: v.raft_addr() })
            .collect())
    }

    async fn add_voter(&self, peer: &Peer) -> Result<()> {
        self.as_leader(|group, _| {
            if !group.voters.contains(peer) {
                group.voters.push(peer.clone());
            }
            Ok(())
        })
    }

    async fn remove_server(&self, name: &str) -> Result<()> {
        self.as_leader(|group, leader| {
            group.voters.retain(|v| v.name != name);
            if name == leader {
                group.failover(Some(leader));
            }
            Ok(())
        })
    }

    async fn transfer_leadership(&self) -> Result<()> {
        self.as_leader(|group, leader| {
            let next = group
                .voters
                .iter()
                .map(|v| v.name.clone())
                .find(|n| n != leader && group.is_online(n))
                .ok_or_else(|| Error::Internal("no voter to transfer leadership to".into()))?;
            group.elect(&next)
        })
    }

    async fn leave(&self) -> Result<()> {
        if self.is_down() {
            return Ok(());
        }
        let mut group = self.group.lock();
        group.voters.retain(|v| v.name != self.peer.name);
        group.take_offline(&self.peer.name);
        tracing::info!(member = %self.peer.name, "left consensus group");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.is_down() {
            return Ok(());
        }
        self.group.lock().take_offline(&self.peer.name);
        Ok(())
    }
}

// ============================================================================
// RPC
// ============================================================================

/// Dials registered in-process services by peer name.
#[derive(Default)]
pub struct LocalDialer {
    services: RwLock<HashMap<String, Arc<ReplicaService>>>,
    token: Option<String>,
}

impl LocalDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self { token: Some(token.into()), ..Self::default() }
    }

    pub fn register(&self, name: impl Into<String>, service: Arc<ReplicaService>) {
        self.services.write().insert(name.into(), service);
    }

    /// make `name` unreachable
    pub fn unregister(&self, name: &str) {
        self.services.write().remove(name);
    }
}

#[async_trait]
impl Dialer for LocalDialer {
    async fn dial(&self, peer: &Peer) -> Result<Arc<dyn Client>> {
        let service = self.services.read().get(&peer.name).cloned().ok_or_else(|| Error::Remote {
            code: Code::Unavailable,
            message: format!("{} is unreachable", peer.name),
        })?;

        let call = Call { token: self.token.clone(), ..Call::default() };
        Ok(Arc::new(ServiceClient { service, call }))
    }
}

/// Client over a service in the same process; errors cross as remote errors.
pub struct ServiceClient {
    service: Arc<ReplicaService>,
    call: Call,
}

#[async_trait]
impl Client for ServiceClient {
    async fn dispatch(&self, messages: Vec<Message>) -> Result<()> {
        self.service.dispatch(&self.call, messages).await.map_err(|e| e.to_remote())
    }

    async fn info(&self) -> Result<Info> {
        self.service.info(&self.call).map_err(|e| e.to_remote())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// ARCHIVES
// ============================================================================

/// Archive storage backed by a map.
#[derive(Clone, Default)]
pub struct MemoryArchives {
    stored: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryArchives {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, deployment_id: &str) -> Option<Vec<u8>> {
        self.stored.lock().get(deployment_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.stored.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArchiveStorage for MemoryArchives {
    async fn new_upload(&self, deployment_id: &str, size: u64) -> Result<Box<dyn Uploader>> {
        Ok(Box::new(MemoryUpload {
            deployment_id: deployment_id.to_string(),
            buf: Vec::with_capacity(size as usize),
            stored: Arc::clone(&self.stored),
        }))
    }
}

struct MemoryUpload {
    deployment_id: String,
    buf: Vec<u8>,
    stored: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

#[async_trait]
impl Uploader for MemoryUpload {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<String> {
        let this = *self;
        let location = format!("memory://{}", this.deployment_id);
        this.stored.lock().insert(this.deployment_id, this.buf);
        Ok(location)
    }

    async fn abort(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::FsmSnapshot;
    use std::io::Read;
    use std::net::{IpAddr, Ipv4Addr};

    /// counts applied payload bytes
    #[derive(Default)]
    struct Counter {
        total: Mutex<Vec<u8>>,
    }

    struct CounterSnapshot(Vec<u8>);

    impl FsmSnapshot for CounterSnapshot {
        fn persist(&self, sink: &mut dyn Write) -> Result<()> {
            sink.write_all(&self.0)?;
            Ok(())
        }

        fn release(self: Box<Self>) {}
    }

    impl StateMachine for Counter {
        fn apply(&self, entry: &LogEntry) -> Result<()> {
            self.total.lock().extend_from_slice(&entry.command);
            Ok(())
        }

        fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>> {
            Ok(Box::new(CounterSnapshot(self.total.lock().clone())))
        }

        fn restore(&self, source: &mut dyn Read) -> Result<()> {
            let mut buf = Vec::new();
            source.read_to_end(&mut buf)?;
            *self.total.lock() = buf;
            Ok(())
        }
    }

    fn peer(i: u16) -> Peer {
        Peer::new(format!("node-{}", i), IpAddr::V4(Ipv4Addr::LOCALHOST), 7000 + i, 8000 + i, 9000 + i)
    }

    #[tokio::test]
    async fn first_joiner_bootstraps_and_leads() {
        let network = LocalNetwork::new();
        let peers = vec![peer(1), peer(2), peer(3)];
        let node = network.join(&peer(1), &peers, Arc::new(Counter::default())).await.unwrap();

        assert_eq!(network.voters(), vec!["node-1", "node-2", "node-3"]);
        assert_eq!(node.state(), RaftState::Leader);
        assert_eq!(node.leader(), Some(peer(1).raft_addr()));
    }

    #[tokio::test]
    async fn followers_apply_committed_entries() {
        let network = LocalNetwork::new();
        let peers = vec![peer(1), peer(2)];
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        let leader = network.join(&peer(1), &peers, a.clone()).await.unwrap();
        let follower = network.join(&peer(2), &peers, b.clone()).await.unwrap();

        leader.apply(b"xy".to_vec(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(*b.total.lock(), b"xy".to_vec());
        assert!(matches!(follower.apply(b"z".to_vec(), Duration::from_secs(1)).await, Err(Error::NoLeader)));
    }

    #[tokio::test]
    async fn crash_fails_over_to_next_voter() {
        let network = LocalNetwork::new();
        let peers = vec![peer(1), peer(2)];
        let first = network.join(&peer(1), &peers, Arc::new(Counter::default())).await.unwrap();
        let second = network.join(&peer(2), &peers, Arc::new(Counter::default())).await.unwrap();

        network.crash("node-1");
        assert_eq!(first.state(), RaftState::Shutdown);
        assert_eq!(second.state(), RaftState::Leader);
        assert_eq!(network.leader_name().as_deref(), Some("node-2"));
    }

    #[tokio::test]
    async fn restart_restores_snapshot_then_catches_up() {
        let network = LocalNetwork::new();
        let peers = vec![peer(1), peer(2)];
        let leader = network.join(&peer(1), &peers, Arc::new(Counter::default())).await.unwrap();
        network.join(&peer(2), &peers, Arc::new(Counter::default())).await.unwrap();

        leader.apply(b"ab".to_vec(), Duration::from_secs(1)).await.unwrap();
        let meta = network.snapshot("node-2").unwrap();
        assert_eq!(meta.index, 1);

        network.crash("node-2");
        leader.apply(b"c".to_vec(), Duration::from_secs(1)).await.unwrap();

        let fresh = Arc::new(Counter::default());
        network.restart("node-2", fresh.clone()).unwrap();
        assert_eq!(*fresh.total.lock(), b"abc".to_vec());
        assert_eq!(network.applied("node-2"), Some(2));
    }

    #[tokio::test]
    async fn transfer_moves_leadership() {
        let network = LocalNetwork::new();
        let peers = vec![peer(1), peer(2)];
        let first = network.join(&peer(1), &peers, Arc::new(Counter::default())).await.unwrap();
        let second = network.join(&peer(2), &peers, Arc::new(Counter::default())).await.unwrap();

        first.transfer_leadership().await.unwrap();
        assert_eq!(second.state(), RaftState::Leader);
        assert_eq!(first.state(), RaftState::Follower);
    }

    #[tokio::test]
    async fn memory_archives_store_on_finish() {
        let archives = MemoryArchives::new();
        let mut upload = archives.new_upload("dep", 3).await.unwrap();
        upload.write(b"abc").await.unwrap();
        assert!(archives.is_empty());

        assert_eq!(upload.finish().await.unwrap(), "memory://dep");
        assert_eq!(archives.get("dep"), Some(b"abc".to_vec()));
    }
}
