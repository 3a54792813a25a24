//! # bootstrap
//!
//! why: a starting replica must decide what to deploy before it serves traffic
//! relations: consumes QuorumReconciler outcomes; called by the embedding daemon at startup
//! what: Decision, decide, resolve

use crate::reconcile::QuorumReconciler;
use fleet_core::{Archive, DeployCommand, DeployOptions, Error, Peer, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// the local deploy matches what the fleet agrees on
    UpToDate,
    /// the fleet agrees on a deploy this replica does not run
    Redeploy { archive: Archive, options: DeployOptions },
    /// a deploy is in flight across the fleet; wait for it
    Wait(Archive),
    /// nothing was ever deployed
    Nothing,
}

/// Combine a reconciliation outcome with the locally known last deploy.
///
/// Failed quorum and transport errors are returned to the caller, who may
/// retry or give up.
pub fn decide(outcome: Result<DeployCommand>, local: Option<&DeployCommand>) -> Result<Decision> {
    match outcome {
        Ok(agreed) => {
            let (Some(archive), Some(options)) = (agreed.archive(), agreed.options()) else {
                return Err(Error::Internal(format!("quorum agreed on a {} command", agreed.name())));
            };

            let local_id = local.and_then(|c| c.archive()).map(|a| a.deployment_id.as_str());
            if local_id == Some(archive.deployment_id.as_str()) {
                Ok(Decision::UpToDate)
            } else {
                Ok(Decision::Redeploy { archive: archive.clone(), options: options.clone() })
            }
        }
        Err(Error::ActiveDeployment(archive)) => Ok(Decision::Wait(*archive)),
        Err(Error::NoDeployments) => Ok(Decision::Nothing),
        Err(e) => Err(e),
    }
}

/// Poll `peers` and decide.
pub async fn resolve(reconciler: &QuorumReconciler, peers: &[Peer], local: Option<&DeployCommand>) -> Result<Decision> {
    let decision = decide(reconciler.last_deployment(peers).await, local)?;
    tracing::info!(decision = ?decision, "bootstrap decision");
    Ok(decision)
}
