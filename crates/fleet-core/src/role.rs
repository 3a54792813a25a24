//! # role
//!
//! why: name the roles a node plays in the consensus overlay and the engine beneath it
//! relations: ConsensusRole is driven by the overlay, RaftState is reported by the engine
//! what: ConsensusRole, RaftState

use serde::{Deserialize, Serialize};
use std::fmt;

/// The overlay role of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConsensusRole {
    /// not a candidate, or a candidate that has not joined yet
    #[default]
    Passive,
    /// joined the consensus group as a follower or candidate
    Peer,
    /// joined and elected
    Leader,
}

impl ConsensusRole {
    /// true when the node holds a seat in the consensus group
    pub fn is_member(self) -> bool {
        !matches!(self, ConsensusRole::Passive)
    }
}

impl fmt::Display for ConsensusRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsensusRole::Passive => "passive",
            ConsensusRole::Peer => "peer",
            ConsensusRole::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// The state reported by the underlying consensus engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RaftState {
    /// listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// requesting votes to become leader
    Candidate,
    /// manages log replication
    Leader,
    /// instance has been stopped
    Shutdown,
}
