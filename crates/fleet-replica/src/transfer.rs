//! # transfer
//!
//! why: a leader that fell out of the top-N candidates must hand off once its deploy is done
//! relations: second stage of the wal chain; reads Membership; wakes the overlay through ClusterChange
//! what: LeadershipTransfer

use crate::consensus::ActiveConsensus;
use crate::membership::Membership;
use crate::notify::ClusterChange;
use crate::wal::{ApplyContext, Ledger, Transcoder};
use fleet_core::{Message, Result};
use std::sync::Arc;

pub struct LeadershipTransfer {
    active: ActiveConsensus,
    membership: Arc<dyn Membership>,
    change: ClusterChange,
}

impl LeadershipTransfer {
    pub fn new(active: ActiveConsensus, membership: Arc<dyn Membership>, change: ClusterChange) -> Self {
        Self { active, membership, change }
    }

    /// leader that fell out of the candidate set
    pub fn should_transfer(&self) -> bool {
        if !self.active.is_leader() {
            return false;
        }
        let local = self.membership.local();
        !self.membership.quorum().contains(&local)
    }

    /// hand leadership away and wake the overlay
    pub async fn rotate(active: ActiveConsensus, change: ClusterChange) -> Result<()> {
        let Some(consensus) = active.get() else {
            return Ok(());
        };

        consensus.transfer_leadership().await?;
        tracing::info!(peer = %consensus.local().name, "leadership transferred after deploy");
        change.broadcast();
        Ok(())
    }
}

impl Transcoder for LeadershipTransfer {
    fn decode(&self, ctx: &ApplyContext, _ledger: &mut Ledger, message: &Message) -> Result<()> {
        let completed = message.deploy_command().map_or(false, |c| c.is_completion());
        if !completed || ctx.recovering || !self.should_transfer() {
            return Ok(());
        }

        // apply runs inside the consensus engine; the transfer must not
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no runtime available for leadership transfer");
            return Ok(());
        };

        let active = self.active.clone();
        let change = self.change.clone();
        handle.spawn(async move {
            if let Err(e) = Self::rotate(active, change).await {
                tracing::warn!(error = %e, "leadership transfer failed");
            }
        });
        Ok(())
    }
}
