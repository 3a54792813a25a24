//! # transcoder
//!
//! why: one seam per concern in the apply pipeline
//! relations: ReplicatedLog runs the chain under the ledger write guard; tracker, transfer, authority, history, logger implement it
//! what: ApplyContext, Transcoder

use super::Ledger;
use fleet_core::{Message, Result};
use std::io::Write;

/// Per-apply context handed down the transcoder chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyContext {
    /// set while a snapshot is being restored; replay must be idempotent
    pub recovering: bool,
}

impl ApplyContext {
    pub fn live() -> Self {
        Self { recovering: false }
    }

    pub fn recovering() -> Self {
        Self { recovering: true }
    }
}

/// One stage of the apply pipeline.
///
/// Each transcoder reacts to the message kinds it owns and ignores the rest.
/// The first error aborts the chain and is returned to the consensus engine.
///
/// The whole chain runs while the log holds the ledger write guard, so a
/// stage sees and edits `ledger` directly and must never lock it again.
pub trait Transcoder: Send + Sync {
    fn decode(&self, ctx: &ApplyContext, ledger: &mut Ledger, message: &Message) -> Result<()>;

    /// Write private trailer records into a snapshot.
    ///
    /// Trailer records are messages; restore feeds them back through
    /// `decode`, so they must be marked `disallow_wal`.
    fn encode(&self, _sink: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    /// Drop in-memory state before a restore.
    fn reset(&self) {}
}
