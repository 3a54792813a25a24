//! # rpc
//!
//! why: forward messages to the leader and poll peers over any transport
//! relations: used by the router and the reconciler; implemented by the daemon and local::LocalDialer
//! what: Client, Dialer
//!
//! The transport is pluggable; the replication core only needs to push
//! messages to the leader and ask peers for their deploy status.

use crate::deploy::Info;
use async_trait::async_trait;
use fleet_core::{Message, Peer, Result};
use std::sync::Arc;

/// Connection to a single remote replica.
#[async_trait]
pub trait Client: Send + Sync {
    /// Forward messages for replication; the remote must be able to reach its leader.
    async fn dispatch(&self, messages: Vec<Message>) -> Result<()>;

    /// The remote replica's self-reported deploy status.
    async fn info(&self) -> Result<Info>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: &Peer) -> Result<Arc<dyn Client>>;
}
