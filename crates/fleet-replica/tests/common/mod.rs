//! shared fixtures: peers, archives, a gated deployer and an in-process cluster

#![allow(dead_code)]

use async_trait::async_trait;
use fleet_core::{Archive, DeployCommand, DeployOptions, Error, Message, Peer, Result};
use fleet_replica::local::{LocalDialer, LocalNetwork, MemoryArchives};
use fleet_replica::wal::{Ledger, ReplicatedLog, Transcoder};
use fleet_replica::{Deployer, DeploymentTracker, Membership, ReplicaConfig, ReplicaNode, ReplicaParts, StaticMembership};
use fleet_replica::ClusterChange;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const KEY: &str = "bw.consensus";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// peer with ports unique to `i`
pub fn peer(i: u16) -> Peer {
    named_peer(&format!("node-{}", i), i)
}

pub fn named_peer(name: &str, i: u16) -> Peer {
    Peer::new(name, IpAddr::V4(Ipv4Addr::LOCALHOST), 7000 + i, 8000 + i, 9000 + i)
}

pub fn archive(id: &str) -> Archive {
    Archive {
        deployment_id: id.to_string(),
        checksum: format!("sum-{}", id),
        location: format!("memory://{}", id),
        bytes: 64,
        initiator: "ops".into(),
        peer: None,
        ts: 0,
    }
}

pub fn begin(id: &str) -> Message {
    Message::deploy(peer(1), DeployCommand::begin(archive(id), DeployOptions::default()))
}

pub fn done(id: &str) -> Message {
    Message::deploy(peer(1), DeployCommand::done(archive(id), DeployOptions::default()))
}

pub fn failed(id: &str) -> Message {
    Message::deploy(peer(1), DeployCommand::failed(archive(id), DeployOptions::default()))
}

pub fn cancel() -> Message {
    Message::deploy(peer(1), DeployCommand::cancel("ops"))
}

pub fn restart() -> Message {
    Message::deploy(peer(1), DeployCommand::restart("ops"))
}

/// a replicated log with only the deployment tracker in its chain
pub fn tracked_log() -> (Arc<ReplicatedLog>, Arc<DeploymentTracker>) {
    let ledger = Ledger::new_shared();
    let tracker = Arc::new(DeploymentTracker::new(Arc::clone(&ledger)));
    let chain: Vec<Arc<dyn Transcoder>> = vec![tracker.clone() as Arc<dyn Transcoder>];
    (Arc::new(ReplicatedLog::new(ledger, chain)), tracker)
}

/// Deployer that blocks until released.
pub struct GatedDeployer {
    gate: watch::Sender<bool>,
    fail: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl GatedDeployer {
    pub fn closed() -> Arc<Self> {
        let (gate, _) = watch::channel(false);
        Arc::new(Self { gate, fail: AtomicBool::new(false), calls: Mutex::new(Vec::new()) })
    }

    pub fn open() -> Arc<Self> {
        let deployer = Self::closed();
        deployer.release();
        deployer
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn fail_deploys(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// deployment ids in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Deployer for GatedDeployer {
    async fn deploy(&self, _options: &DeployOptions, archive: &Archive, _peers: &[Peer]) -> Result<()> {
        self.calls.lock().push(archive.deployment_id.clone());

        let mut gate = self.gate.subscribe();
        let opened = gate.wait_for(|open| *open).await.is_ok();
        if !opened {
            return Err(Error::Cancelled);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Aborted("deploy failed".into()));
        }
        Ok(())
    }
}

pub struct TestNode {
    pub node: ReplicaNode,
    pub membership: Arc<StaticMembership>,
    pub change: ClusterChange,
    pub deployer: Arc<GatedDeployer>,
    pub archives: MemoryArchives,
}

impl TestNode {
    pub fn name(&self) -> &str {
        &self.node.local().name
    }

    /// consensus seats as this node's overlay sees them
    pub fn quorum(&self) -> Vec<Peer> {
        self.node.membership().quorum()
    }
}

/// `n` replicas sharing one in-process consensus group and dialer.
pub struct Cluster {
    pub network: LocalNetwork,
    pub dialer: Arc<LocalDialer>,
    pub peers: Vec<Peer>,
    pub nodes: Vec<TestNode>,
}

pub fn test_config(quorum_size: usize) -> ReplicaConfig {
    ReplicaConfig::builder()
        .quorum_size(quorum_size)
        .selection_key(KEY)
        .tick_interval_ms(20)
        .reconcile_timeout_ms(200)
        .leave_timeout_ms(200)
        .history_capacity(32)
        .observer_buffer(32)
        .build()
        .unwrap()
}

impl Cluster {
    pub fn new(n: u16, quorum_size: usize) -> Self {
        Self::with_config(n, test_config(quorum_size))
    }

    pub fn with_config(n: u16, config: ReplicaConfig) -> Self {
        init_tracing();
        let network = LocalNetwork::new();
        let dialer = Arc::new(LocalDialer::new());
        let peers: Vec<Peer> = (1..=n).map(peer).collect();

        let nodes = peers
            .iter()
            .map(|local| {
                let change = ClusterChange::new();
                let membership = Arc::new(StaticMembership::new(local.clone(), peers.clone(), change.clone()));
                let deployer = GatedDeployer::closed();
                let archives = MemoryArchives::new();
                let node = ReplicaNode::new(ReplicaParts {
                    config: config.clone(),
                    membership: membership.clone(),
                    change: change.clone(),
                    factory: Arc::new(network.clone()),
                    dialer: dialer.clone(),
                    deployer: deployer.clone(),
                    archives: Arc::new(archives.clone()),
                })
                .unwrap();
                dialer.register(local.name.clone(), Arc::clone(node.service()));
                TestNode { node, membership, change, deployer, archives }
            })
            .collect();

        Self { network, dialer, peers, nodes }
    }

    pub fn node(&self, name: &str) -> &TestNode {
        self.nodes.iter().find(|n| n.name() == name).unwrap()
    }

    pub fn leader(&self) -> &TestNode {
        let name = self.network.leader_name().unwrap();
        self.node(&name)
    }

    pub fn followers(&self) -> Vec<&TestNode> {
        let leader = self.network.leader_name();
        self.nodes.iter().filter(|n| Some(n.name()) != leader.as_deref()).collect()
    }

    /// step every overlay twice, then let spawned work finish
    pub async fn step_all(&self) {
        for _ in 0..2 {
            for node in &self.nodes {
                node.node.overlay().step().await.unwrap();
            }
        }
        settle().await;
    }

    /// crash `name` and make it unreachable
    pub fn crash(&self, name: &str) {
        self.network.crash(name);
        self.dialer.unregister(name);
    }

    /// add a peer to every node's membership view
    pub fn join_everywhere(&self, peer: &Peer) {
        for node in &self.nodes {
            node.membership.join(peer.clone());
        }
    }
}

/// let spawned tasks run to completion
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// poll `condition` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
