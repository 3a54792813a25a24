//! # node
//!
//! why: one place that wires a replica together in the right order
//! relations: owns every component in this crate; the embedding daemon supplies the collaborators
//! what: ReplicaParts (collaborators + config), ReplicaNode (wiring, accessors, overlay spawn)

use crate::bus::EventBus;
use crate::config::ReplicaConfig;
use crate::consensus::{ActiveConsensus, ConsensusFactory, StateMachine};
use crate::deploy::{Deployer, DeploymentReplicator, DeploymentTracker};
use crate::dispatch::{Dispatcher, Router};
use crate::membership::{Membership, SeatedMembership};
use crate::notify::ClusterChange;
use crate::overlay::{Overlay, RoleObserver};
use crate::reconcile::QuorumReconciler;
use crate::rpc::Dialer;
use crate::service::{ArchiveStorage, ReplicaService};
use crate::transfer::LeadershipTransfer;
use crate::wal::authority::AuthorityTranscoder;
use crate::wal::history::HistoryTranscoder;
use crate::wal::logger::LogTranscoder;
use crate::wal::{Ledger, ReplicatedLog, Transcoder};
use fleet_core::{Error, Peer, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What a replica needs from the process it runs in.
pub struct ReplicaParts {
    pub config: ReplicaConfig,
    /// gossip view; the node narrows its quorum to the configured seats
    pub membership: Arc<dyn Membership>,
    /// must be the channel the membership broadcasts on
    pub change: ClusterChange,
    pub factory: Arc<dyn ConsensusFactory>,
    pub dialer: Arc<dyn Dialer>,
    pub deployer: Arc<dyn Deployer>,
    pub archives: Arc<dyn ArchiveStorage>,
}

pub struct ReplicaNode {
    local: Peer,
    config: ReplicaConfig,
    membership: Arc<dyn Membership>,
    active: ActiveConsensus,
    bus: Arc<EventBus>,
    tracker: Arc<DeploymentTracker>,
    authority: Arc<AuthorityTranscoder>,
    history: Arc<HistoryTranscoder>,
    wal: Arc<ReplicatedLog>,
    router: Arc<Router>,
    reconciler: Arc<QuorumReconciler>,
    replicator: Arc<DeploymentReplicator>,
    service: Arc<ReplicaService>,
    overlay: Arc<Overlay>,
}

impl ReplicaNode {
    pub fn new(parts: ReplicaParts) -> Result<Self> {
        let ReplicaParts { config, membership, change, factory, dialer, deployer, archives } = parts;
        config.validate().map_err(Error::Malformed)?;

        // consensus seats are the configured top-N for the selection key
        let membership: Arc<dyn Membership> = Arc::new(SeatedMembership::new(membership, &config));
        let local = membership.local();
        let active = ActiveConsensus::new();
        let bus = EventBus::new(config.observer_buffer);
        let ledger = Ledger::new_shared();

        let tracker = Arc::new(DeploymentTracker::new(Arc::clone(&ledger)));
        let transfer = Arc::new(LeadershipTransfer::new(active.clone(), Arc::clone(&membership), change.clone()));
        let authority = Arc::new(AuthorityTranscoder::new(config.authority_dir.clone()));
        let history = Arc::new(HistoryTranscoder::new(config.history_capacity, Arc::clone(&bus)));
        let logger = Arc::new(LogTranscoder);

        // order matters: admission first, logging last
        let chain: Vec<Arc<dyn Transcoder>> = vec![
            tracker.clone() as Arc<dyn Transcoder>,
            transfer as Arc<dyn Transcoder>,
            authority.clone() as Arc<dyn Transcoder>,
            history.clone() as Arc<dyn Transcoder>,
            logger as Arc<dyn Transcoder>,
        ];
        let wal = Arc::new(ReplicatedLog::new(Arc::clone(&ledger), chain));

        let router = Arc::new(Router::new(
            active.clone(),
            Arc::clone(&membership),
            Arc::clone(&dialer),
            config.apply_timeout(),
        ));
        let reconciler = Arc::new(QuorumReconciler::new(dialer, config.reconcile_timeout()));
        let replicator = DeploymentReplicator::new(
            ledger,
            router.clone(),
            Arc::clone(&membership),
            active.clone(),
            deployer,
            Arc::clone(&reconciler),
        );

        let service = Arc::new(ReplicaService::new(
            local.clone(),
            config.token.clone(),
            router.clone(),
            Arc::clone(&replicator),
            Arc::clone(&history),
            Arc::clone(&bus),
            archives,
            config.max_uploads,
        ));

        let fsm: Arc<dyn StateMachine> = wal.clone();
        let overlay = Overlay::new(&config, Arc::clone(&membership), factory, fsm, active.clone(), change)
            .with_observer(router.clone() as Arc<dyn RoleObserver>)
            .with_observer(replicator.clone() as Arc<dyn RoleObserver>);

        tracing::info!(peer = %local.name, quorum_size = config.quorum_size, "replica assembled");
        Ok(Self {
            local,
            config,
            membership,
            active,
            bus,
            tracker,
            authority,
            history,
            wal,
            router,
            reconciler,
            replicator,
            service,
            overlay: Arc::new(overlay),
        })
    }

    /// Run the overlay until `cancel` fires; the task drains before exiting.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.overlay).run(cancel))
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// membership narrowed to the configured consensus seats
    pub fn membership(&self) -> &Arc<dyn Membership> {
        &self.membership
    }

    pub fn active(&self) -> &ActiveConsensus {
        &self.active
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn tracker(&self) -> &Arc<DeploymentTracker> {
        &self.tracker
    }

    pub fn authority(&self) -> &Arc<AuthorityTranscoder> {
        &self.authority
    }

    pub fn history(&self) -> &Arc<HistoryTranscoder> {
        &self.history
    }

    pub fn wal(&self) -> &Arc<ReplicatedLog> {
        &self.wal
    }

    /// the replicated log as the consensus engine sees it
    pub fn state_machine(&self) -> Arc<dyn StateMachine> {
        self.wal.clone()
    }

    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        self.router.clone()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn reconciler(&self) -> &Arc<QuorumReconciler> {
        &self.reconciler
    }

    pub fn replicator(&self) -> &Arc<DeploymentReplicator> {
        &self.replicator
    }

    pub fn service(&self) -> &Arc<ReplicaService> {
        &self.service
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }
}
