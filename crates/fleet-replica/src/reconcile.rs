//! # reconcile
//!
//! why: recover "what was the last deployment" from the fleet after a restart or leader change
//! relations: used by the replicator on leadership and by the bootstrap decision on startup
//! what: QuorumReconciler (parallel status poll) and the pure majority tally

use crate::deploy::Info;
use crate::rpc::Dialer;
use fleet_core::{Archive, DeployCommand, Error, Peer, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

pub struct QuorumReconciler {
    dialer: Arc<dyn Dialer>,
    timeout: Duration,
}

impl QuorumReconciler {
    pub fn new(dialer: Arc<dyn Dialer>, timeout: Duration) -> Self {
        Self { dialer, timeout }
    }

    async fn poll(&self, peer: &Peer) -> Result<Info> {
        let client = self.dialer.dial(peer).await?;
        let info = client.info().await;
        if let Err(e) = client.close().await {
            tracing::debug!(peer = %peer.name, error = %e, "closing status connection");
        }
        info
    }

    /// Ask every peer for its deploy status; unreachable peers are skipped.
    pub async fn collect(&self, peers: &[Peer]) -> Vec<Info> {
        let polls = peers.iter().map(|peer| async move {
            let outcome = match tokio::time::timeout(self.timeout, self.poll(peer)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(self.timeout)),
            };
            (peer, outcome)
        });

        join_all(polls)
            .await
            .into_iter()
            .filter_map(|(peer, outcome)| match outcome {
                Ok(info) => Some(info),
                Err(e) => {
                    tracing::warn!(peer = %peer.name, error = %e, "skipping peer in quorum poll");
                    None
                }
            })
            .collect()
    }

    /// The last deployment a majority of `peers` agree on.
    pub async fn last_deployment(&self, peers: &[Peer]) -> Result<DeployCommand> {
        let reports = self.collect(peers).await;
        let outcome = tally(peers.len(), &reports);
        match &outcome {
            Ok(command) => {
                let id = command.archive().map(|a| a.deployment_id.as_str()).unwrap_or("-");
                tracing::info!(deployment = id, reports = reports.len(), peers = peers.len(), "quorum agreed on last deploy");
            }
            Err(e) => tracing::info!(error = %e, reports = reports.len(), peers = peers.len(), "quorum poll inconclusive"),
        }
        outcome
    }
}

/// Majority vote over status reports from `peers` polled peers.
///
/// A running deploy held by a majority wins over any completed one. Among
/// completed deploys the most common identifier wins; on equal counts the
/// first one seen wins.
pub fn tally(peers: usize, reports: &[Info]) -> Result<DeployCommand> {
    let threshold = peers.saturating_sub(1) / 2;

    let running = count_by_id(reports.iter().filter_map(|info| info.running.as_ref()));
    if let Some((command, count)) = leader_of(&running) {
        if count > threshold {
            if let Some(archive) = command.archive() {
                return Err(Error::ActiveDeployment(Box::new(archive.clone())));
            }
        }
    }

    let completed = count_by_id(reports.iter().filter_map(|info| info.last_successful.as_ref()));
    let (command, count) = leader_of(&completed).ok_or(Error::NoDeployments)?;
    if count <= threshold {
        return Err(Error::FailedQuorum { count, peers });
    }
    Ok(command.clone())
}

// insertion ordered so ties keep the first identifier seen
fn count_by_id<'a>(commands: impl Iterator<Item = &'a DeployCommand>) -> Vec<(&'a DeployCommand, usize)> {
    let mut counts: Vec<(&DeployCommand, usize)> = Vec::new();
    for command in commands {
        let Some(id) = command.archive().map(deployment_id) else {
            continue;
        };
        match counts.iter_mut().find(|(seen, _)| seen.archive().map(deployment_id) == Some(id)) {
            Some((_, count)) => *count += 1,
            None => counts.push((command, 1)),
        }
    }
    counts
}

fn leader_of<'a>(counts: &[(&'a DeployCommand, usize)]) -> Option<(&'a DeployCommand, usize)> {
    let mut best: Option<(&DeployCommand, usize)> = None;
    for &(command, count) in counts {
        if best.map_or(true, |(_, max)| count > max) {
            best = Some((command, count));
        }
    }
    best
}

fn deployment_id(archive: &Archive) -> &str {
    &archive.deployment_id
}
