//! # logger
//!
//! why: an operator-readable trail of everything the group applies
//! relations: last stage of the wal chain
//! what: LogTranscoder

use super::transcoder::{ApplyContext, Transcoder};
use super::Ledger;
use fleet_core::{Event, Message, Result};

/// Last stage of the chain: one tracing event per applied message.
#[derive(Debug, Default)]
pub struct LogTranscoder;

impl Transcoder for LogTranscoder {
    fn decode(&self, ctx: &ApplyContext, _ledger: &mut Ledger, message: &Message) -> Result<()> {
        let origin = &message.origin.name;
        match &message.event {
            Event::Log(log) => {
                tracing::info!(%origin, recovering = ctx.recovering, "{}", log.text);
            }
            Event::Deploy(command) => {
                let deployment = command.archive().map(|a| a.deployment_id.as_str()).unwrap_or("-");
                tracing::info!(%origin, command = command.name(), deployment, recovering = ctx.recovering, "deploy command applied");
            }
            Event::Peer(peer) => {
                tracing::debug!(%origin, peer = %peer.peer.name, kind = ?peer.kind, "peer event applied");
            }
            Event::Authority(authority) => {
                tracing::debug!(%origin, fingerprint = %authority.fingerprint, "authority event applied");
            }
            Event::Counter(counter) => {
                tracing::debug!(%origin, name = %counter.name, value = counter.value, "counter applied");
            }
            Event::History(history) => {
                tracing::debug!(%origin, messages = history.messages.len(), "history applied");
            }
        }
        Ok(())
    }
}
