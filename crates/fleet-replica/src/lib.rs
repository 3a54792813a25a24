//! Consensus-backed deployment replication for a fleet of agents.
//!
//! A small, rotating subset of the fleet (the top-N rendezvous candidates of
//! the gossip membership) runs a consensus group. Deploy commands are
//! replicated through its log and applied by every replica in committed
//! order, which is what keeps "what is running" and "what last succeeded"
//! consistent across the fleet.
//!
//! # Architecture
//!
//! ```text
//!   membership ──► overlay ──join/leave/reconcile──► consensus engine
//!       │             │                                  │ committed entries
//!       │             ▼                                  ▼
//!       │      role observers                     replicated log (wal)
//!       │   (router, replicator)          tracker ► transfer ► authority ► history ► logger
//!       │             │                                  │
//!       ▼             ▼                                  ▼
//!   reconciler ◄── replicator ──dispatch──► router ──► leader apply / proxy to leader
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let node = ReplicaNode::new(parts)?;
//! let overlay = node.spawn(cancel.clone());
//! node.service().deploy(&Call::default(), options, archive, vec![]).await?;
//! ```

pub mod bootstrap;
pub mod bus;
pub mod config;
pub mod consensus;
pub mod deploy;
pub mod dispatch;
pub mod local;
pub mod membership;
pub mod node;
pub mod notify;
pub mod overlay;
pub mod reconcile;
pub mod rpc;
pub mod service;
pub mod transfer;
pub mod wal;

pub use bootstrap::Decision;
pub use bus::{EventBus, Observer};
pub use config::ReplicaConfig;
pub use consensus::{ActiveConsensus, Consensus, ConsensusFactory, FsmSnapshot, StateMachine, Voter};
pub use deploy::{Deployer, DeploymentReplicator, DeploymentTracker, Info, Mode};
pub use dispatch::{Dispatcher, Router};
pub use membership::{Membership, SeatedMembership, StaticMembership};
pub use node::{ReplicaNode, ReplicaParts};
pub use notify::ClusterChange;
pub use overlay::{Action, Overlay, RoleObserver, Transition, View};
pub use reconcile::QuorumReconciler;
pub use rpc::{Client, Dialer};
pub use service::{ArchiveStorage, Call, ReplicaService, Uploader, Watch};
pub use transfer::LeadershipTransfer;
pub use wal::{ApplyContext, Ledger, ReplicatedLog, Transcoder};

pub use fleet_core::{Code, Error, Result};
