//! # deploy
//!
//! why: the deployment lifecycle every replica agrees on, and the leader-side driver of it
//! relations: DeploymentTracker runs first in the wal chain; DeploymentReplicator dispatches through the router
//! what: DeploymentTracker (admission guard + running/last pointers), DeploymentReplicator, Info, Deployer

use crate::consensus::ActiveConsensus;
use crate::dispatch::Dispatcher;
use crate::membership::{self, Membership};
use crate::overlay::RoleObserver;
use crate::reconcile::QuorumReconciler;
use crate::wal::{ApplyContext, Ledger, Transcoder};
use async_trait::async_trait;
use fleet_core::{Archive, ConsensusRole, DeployCommand, DeployOptions, Error, Message, Peer, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

// ============================================================================
// TRACKER
// ============================================================================

/// Applies deploy commands to the shared ledger.
///
/// Idle -> (begin) Deploying -> (done | failed) Idle. Cancel forces Idle;
/// restart keeps the running command but reopens admission.
pub struct DeploymentTracker {
    ledger: Arc<RwLock<Ledger>>,
    admission: AtomicBool,
}

impl DeploymentTracker {
    pub fn new(ledger: Arc<RwLock<Ledger>>) -> Self {
        Self { ledger, admission: AtomicBool::new(false) }
    }

    /// true while a begin holds the admission guard
    pub fn is_admitted(&self) -> bool {
        self.admission.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> Option<DeployCommand> {
        self.ledger.read().running.clone()
    }

    pub fn last_successful(&self) -> Option<DeployCommand> {
        self.ledger.read().last_successful.clone()
    }
}

impl Transcoder for DeploymentTracker {
    fn decode(&self, ctx: &ApplyContext, ledger: &mut Ledger, message: &Message) -> Result<()> {
        let Some(command) = message.deploy_command() else {
            return Ok(());
        };

        match command {
            DeployCommand::Begin { .. } => {
                if ctx.recovering {
                    self.admission.store(true, Ordering::SeqCst);
                } else if self
                    .admission
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(Error::DeployInProgress);
                }
                ledger.running = Some(command.clone());
            }
            DeployCommand::Done { .. } => {
                ledger.running = None;
                ledger.last_successful = Some(command.clone());
                self.admission.store(false, Ordering::SeqCst);
            }
            DeployCommand::Failed { .. } | DeployCommand::Cancel { .. } => {
                ledger.running = None;
                self.admission.store(false, Ordering::SeqCst);
            }
            DeployCommand::Restart { .. } => {
                self.admission.store(false, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn reset(&self) {
        self.admission.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Idle,
    Deploying,
}

/// Answer to status and info queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Info {
    pub mode: Mode,
    pub running: Option<DeployCommand>,
    pub last_successful: Option<DeployCommand>,
    pub leader: Option<Peer>,
    pub quorum: Vec<Peer>,
}

/// Pushes an archive out to the fleet.
///
/// Implemented by the archive transport; an empty `peers` list means every
/// peer.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, options: &DeployOptions, archive: &Archive, peers: &[Peer]) -> Result<()>;
}

// ============================================================================
// REPLICATOR
// ============================================================================

pub struct DeploymentReplicator {
    me: Weak<DeploymentReplicator>,
    local: Peer,
    ledger: Arc<RwLock<Ledger>>,
    dispatcher: Arc<dyn Dispatcher>,
    membership: Arc<dyn Membership>,
    active: ActiveConsensus,
    deployer: Arc<dyn Deployer>,
    reconciler: Arc<QuorumReconciler>,
}

impl DeploymentReplicator {
    pub fn new(
        ledger: Arc<RwLock<Ledger>>,
        dispatcher: Arc<dyn Dispatcher>,
        membership: Arc<dyn Membership>,
        active: ActiveConsensus,
        deployer: Arc<dyn Deployer>,
        reconciler: Arc<QuorumReconciler>,
    ) -> Arc<Self> {
        let local = membership.local();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local,
            ledger,
            dispatcher,
            membership,
            active,
            deployer,
            reconciler,
        })
    }

    pub fn status(&self) -> Info {
        let (running, last_successful) = {
            let ledger = self.ledger.read();
            (ledger.running.clone(), ledger.last_successful.clone())
        };

        let leader = self
            .active
            .leader()
            .and_then(|addr| membership::find_by_raft_addr(&self.membership.peers(), addr));

        Info {
            mode: if running.is_some() { Mode::Deploying } else { Mode::Idle },
            running,
            last_successful,
            leader,
            quorum: self.membership.quorum(),
        }
    }

    async fn send(&self, command: DeployCommand) -> Result<()> {
        self.dispatcher.dispatch(vec![Message::deploy(self.local.clone(), command)]).await
    }

    async fn announce(&self, text: impl Into<String>) -> Result<()> {
        self.dispatcher.dispatch(vec![Message::log(self.local.clone(), text)]).await
    }

    /// Replicate a begin, then drive the deploy in the background.
    ///
    /// Returns once the begin is applied; admission errors surface here.
    pub async fn deploy(&self, options: DeployOptions, archive: Archive, peers: Vec<Peer>) -> Result<()> {
        self.send(DeployCommand::begin(archive.clone(), options.clone())).await?;
        tracing::info!(deployment = %archive.deployment_id, peers = peers.len(), "deploy admitted");

        let Some(me) = self.me.upgrade() else {
            return Err(Error::Internal("replicator dropped".into()));
        };
        tokio::spawn(async move {
            if let Err(e) = me.drive(options, archive, peers).await {
                tracing::warn!(error = %e, "failed to record deploy outcome");
            }
        });
        Ok(())
    }

    /// Run the deployer and replicate its outcome as done or failed.
    pub async fn drive(&self, options: DeployOptions, archive: Archive, peers: Vec<Peer>) -> Result<()> {
        match self.deployer.deploy(&options, &archive, &peers).await {
            Ok(()) => {
                tracing::info!(deployment = %archive.deployment_id, "deploy done");
                self.send(DeployCommand::done(archive, options)).await
            }
            Err(e) => {
                tracing::warn!(deployment = %archive.deployment_id, error = %e, "deploy failed");
                self.send(DeployCommand::failed(archive, options)).await
            }
        }
    }

    pub async fn cancel(&self, initiator: impl Into<String>) -> Result<()> {
        self.send(DeployCommand::cancel(initiator)).await
    }

    pub async fn restart(&self, initiator: impl Into<String>) -> Result<()> {
        self.send(DeployCommand::restart(initiator)).await
    }

    /// Recover deploy state after this node became leader.
    ///
    /// Without a local last-successful deploy the fleet is polled and a
    /// majority answer is re-injected as a done. A deploy that was running
    /// when leadership changed is cancelled, restarted and deployed again.
    pub async fn recover(&self) -> Result<()> {
        let known = self.ledger.read().last_successful.is_some();
        if !known {
            let peers = self.membership.peers();
            match self.reconciler.last_deployment(&peers).await {
                Ok(DeployCommand::Done { archive, options }) => {
                    tracing::info!(deployment = %archive.deployment_id, "recovered last deploy from quorum");
                    self.send(DeployCommand::done(archive, options)).await?;
                }
                Ok(other) => {
                    tracing::warn!(command = other.name(), "quorum reported a non-terminal deploy, ignoring");
                }
                Err(e) => {
                    tracing::info!(error = %e, "no last deploy recovered from quorum");
                }
            }
        }

        let running = self.ledger.read().running.clone();
        let Some(DeployCommand::Begin { archive, options }) = running else {
            return Ok(());
        };

        tracing::warn!(deployment = %archive.deployment_id, "leadership changed during deploy, restarting it");
        self.announce(format!(
            "leadership changed while deploying {}, restarting",
            archive.deployment_id
        ))
        .await?;
        self.cancel(self.local.name.clone()).await?;
        self.restart(self.local.name.clone()).await?;
        self.deploy(options, archive, Vec::new()).await
    }
}

impl RoleObserver for DeploymentReplicator {
    fn role_changed(&self, from: ConsensusRole, to: ConsensusRole) {
        if to != ConsensusRole::Leader || from == ConsensusRole::Leader {
            return;
        }

        let Some(me) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = me.recover().await {
                tracing::warn!(error = %e, "deploy recovery failed");
            }
        });
    }
}
