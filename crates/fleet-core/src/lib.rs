//! # fleet-core
//!
//! why: shared vocabulary for the deployment replication subsystem, free of async and i/o
//! relations: used by fleet-storage for snapshot metadata, fleet-replica for everything else
//! what: peers, message envelope, deploy commands, consensus log entries, roles, errors, record codec

pub mod codec;
pub mod error;
pub mod log;
pub mod message;
pub mod peer;
pub mod role;

pub use error::{Code, Error, Result};
pub use log::{EntryKind, LogEntry};
pub use message::{
    Archive, AuthorityEvent, CounterEvent, DeployCommand, DeployOptions, Event, HistoryEvent,
    LogEvent, Message, PeerEvent, PeerEventKind,
};
pub use peer::{Capabilities, Peer, PeerStatus};
pub use role::{ConsensusRole, RaftState};
