//! # error
//!
//! why: one error type for every layer, classified for rpc callers
//! relations: returned by the replicated log, dispatcher, reconciler and service
//! what: Code taxonomy, Error enum, Result alias

use crate::message::Archive;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for replication operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Status codes surfaced to rpc callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// authentication rejected
    PermissionDenied,
    /// deploy in progress, no leader, or not a consensus member; retry elsewhere
    Unavailable,
    /// malformed request
    FailedPrecondition,
    /// local storage or cache failure
    Internal,
    /// rate limited
    ResourceExhausted,
    /// nothing to report, or no quorum could be reached
    NotFound,
    /// an upstream step failed
    Aborted,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("deploy already in progress")]
    DeployInProgress,

    #[error("node is not a member of the consensus group")]
    NotMember,

    #[error("no leader elected")]
    NoLeader,

    #[error("no deployments found")]
    NoDeployments,

    #[error("failed to reach quorum: {count} of {peers} peers agree")]
    FailedQuorum { count: usize, peers: usize },

    #[error("deployment {} is still in progress", .0.deployment_id)]
    ActiveDeployment(Box<Archive>),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    /// error reported by a remote peer, already classified
    #[error("{message}")]
    Remote { code: Code, message: String },
}

impl Error {
    pub fn code(&self) -> Code {
        match self {
            Error::DeployInProgress | Error::NotMember | Error::NoLeader | Error::Timeout(_) => {
                Code::Unavailable
            }
            Error::NoDeployments | Error::FailedQuorum { .. } => Code::NotFound,
            // a valid answer the caller must wait out
            Error::ActiveDeployment(_) => Code::Unavailable,
            Error::Malformed(_) | Error::Serialization(_) => Code::FailedPrecondition,
            Error::PermissionDenied(_) => Code::PermissionDenied,
            Error::ResourceExhausted(_) => Code::ResourceExhausted,
            Error::Aborted(_) | Error::Cancelled => Code::Aborted,
            Error::Snapshot(_) | Error::Io(_) | Error::Internal(_) => Code::Internal,
            Error::Remote { code, .. } => *code,
        }
    }

    /// flatten into a form that can cross the wire
    pub fn to_remote(&self) -> Error {
        Error::Remote { code: self.code(), message: self.to_string() }
    }

    /// snapshot and restore failures leave the replica inconsistent
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Snapshot(_))
    }
}
