//! # wal
//!
//! why: turn committed consensus entries into the fleet's deployment state
//! relations: driven by the consensus engine through `StateMachine`; shares its ledger with the tracker
//! what: ReplicatedLog (apply chain, snapshot with compaction, restore) and its transcoders

pub mod authority;
pub mod history;
pub mod logger;
mod transcoder;

pub use transcoder::{ApplyContext, Transcoder};

use crate::consensus::{FsmSnapshot, StateMachine};
use fleet_core::codec;
use fleet_core::{DeployCommand, Error, LogEntry, Message, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// snapshot layout version written into every preamble
pub const SNAPSHOT_VERSION: u32 = 1;

/// Applied state shared between the log and the deployment tracker.
///
/// A single lock covers the replay log and both deploy pointers. Apply,
/// restore, and compaction each hold the write guard for their whole run, so
/// readers and snapshots never observe one updated without the other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    /// replay log, compacted to the latest begin on snapshot release
    pub log: Vec<Message>,
    pub running: Option<DeployCommand>,
    pub last_successful: Option<DeployCommand>,
}

impl Ledger {
    pub fn new_shared() -> Arc<RwLock<Ledger>> {
        Arc::new(RwLock::new(Ledger::default()))
    }

    /// index of the most recent begin, the compaction boundary
    pub fn boundary(&self) -> usize {
        self.log
            .iter()
            .rposition(|m| m.deploy_command().map_or(false, DeployCommand::is_begin))
            .unwrap_or(0)
    }
}

/// First record of every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preamble {
    pub version: u32,
    /// position of the first persisted entry in the log at snapshot time
    pub boundary: usize,
    /// number of entry records following the preamble
    pub entries: usize,
    /// tracker view at snapshot time; may predate the boundary
    pub last_successful: Option<DeployCommand>,
}

/// The finite-state machine behind the consensus group.
pub struct ReplicatedLog {
    ledger: Arc<RwLock<Ledger>>,
    transcoders: Vec<Arc<dyn Transcoder>>,
    recovering: AtomicBool,
    snapshot_seq: Arc<AtomicU64>,
}

impl ReplicatedLog {
    pub fn new(ledger: Arc<RwLock<Ledger>>, transcoders: Vec<Arc<dyn Transcoder>>) -> Self {
        Self {
            ledger,
            transcoders,
            recovering: AtomicBool::new(false),
            snapshot_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn ledger(&self) -> &Arc<RwLock<Ledger>> {
        &self.ledger
    }

    /// copy of the replay log
    pub fn entries(&self) -> Vec<Message> {
        self.ledger.read().log.clone()
    }

    pub fn len(&self) -> usize {
        self.ledger.read().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    fn context(&self) -> ApplyContext {
        ApplyContext { recovering: self.is_recovering() }
    }

    /// Run one message through the transcoder chain.
    ///
    /// The first failing transcoder stops the chain; the message is only
    /// appended when every stage accepted it.
    pub fn apply_message(&self, ctx: &ApplyContext, message: &Message) -> Result<()> {
        let mut ledger = self.ledger.write();
        self.apply_locked(ctx, &mut ledger, message)
    }

    fn apply_locked(&self, ctx: &ApplyContext, ledger: &mut Ledger, message: &Message) -> Result<()> {
        for transcoder in &self.transcoders {
            transcoder.decode(ctx, ledger, message)?;
        }

        if !message.disallow_wal {
            ledger.log.push(message.clone());
        }
        Ok(())
    }

    fn restore_from(&self, source: &mut dyn Read) -> Result<()> {
        let preamble: Preamble = codec::read_json(&mut *source)
            .map_err(snapshot_error)?
            .ok_or_else(|| Error::Snapshot("missing preamble".into()))?;

        if preamble.version != SNAPSHOT_VERSION {
            return Err(Error::Snapshot(format!("unsupported snapshot version {}", preamble.version)));
        }

        // held until the replay finishes; readers wait instead of seeing a partial log
        let mut ledger = self.ledger.write();
        *ledger = Ledger { last_successful: preamble.last_successful.clone(), ..Ledger::default() };
        for transcoder in &self.transcoders {
            transcoder.reset();
        }

        // a release computed against the old log must not truncate the new one
        self.snapshot_seq.fetch_add(1, Ordering::SeqCst);

        let ctx = ApplyContext::recovering();
        let mut records = 0;
        while let Some(message) = codec::read_json::<_, Message>(&mut *source).map_err(snapshot_error)? {
            self.apply_locked(&ctx, &mut ledger, &message)
                .map_err(|e| Error::Snapshot(format!("replaying record {}: {}", records, e)))?;
            records += 1;
        }

        if records < preamble.entries {
            return Err(Error::Snapshot(format!(
                "snapshot truncated: expected {} entries, found {}",
                preamble.entries, records
            )));
        }

        drop(ledger);
        tracing::info!(entries = preamble.entries, trailer = records - preamble.entries, "snapshot restored");
        Ok(())
    }
}

fn snapshot_error(e: io::Error) -> Error {
    Error::Snapshot(e.to_string())
}

impl StateMachine for ReplicatedLog {
    fn apply(&self, entry: &LogEntry) -> Result<()> {
        if !entry.has_payload() {
            return Ok(());
        }

        let message = Message::decode(&entry.command)?;
        let result = self.apply_message(&self.context(), &message);
        if let Err(e) = &result {
            tracing::warn!(index = entry.index, term = entry.term, error = %e, "apply rejected");
        }
        result
    }

    fn snapshot(&self) -> Result<Box<dyn FsmSnapshot>> {
        let ledger = self.ledger.read();
        // sequence and boundary come from the same view of the log
        let seq = self.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let boundary = ledger.boundary();
        let entries = ledger.log[boundary..].to_vec();
        let preamble = Preamble {
            version: SNAPSHOT_VERSION,
            boundary,
            entries: entries.len(),
            last_successful: ledger.last_successful.clone(),
        };
        drop(ledger);

        tracing::debug!(seq, boundary, entries = preamble.entries, "snapshot taken");
        Ok(Box::new(WalSnapshot {
            seq,
            preamble,
            entries,
            transcoders: self.transcoders.clone(),
            ledger: Arc::clone(&self.ledger),
            current_seq: Arc::clone(&self.snapshot_seq),
        }))
    }

    fn restore(&self, source: &mut dyn Read) -> Result<()> {
        self.recovering.store(true, Ordering::SeqCst);
        let result = self.restore_from(source);
        self.recovering.store(false, Ordering::SeqCst);

        if let Err(e) = &result {
            tracing::error!(error = %e, "snapshot restore failed");
        }
        result
    }
}

/// Entries captured at snapshot time; persisting never looks at the live log.
pub struct WalSnapshot {
    seq: u64,
    preamble: Preamble,
    entries: Vec<Message>,
    transcoders: Vec<Arc<dyn Transcoder>>,
    ledger: Arc<RwLock<Ledger>>,
    current_seq: Arc<AtomicU64>,
}

impl WalSnapshot {
    pub fn preamble(&self) -> &Preamble {
        &self.preamble
    }
}

impl FsmSnapshot for WalSnapshot {
    fn persist(&self, sink: &mut dyn Write) -> Result<()> {
        codec::write_json(&mut *sink, &self.preamble).map_err(snapshot_error)?;
        for entry in &self.entries {
            codec::write_json(&mut *sink, entry).map_err(snapshot_error)?;
        }
        for transcoder in &self.transcoders {
            transcoder
                .encode(&mut *sink)
                .map_err(|e| Error::Snapshot(format!("writing trailer: {}", e)))?;
        }
        sink.flush().map_err(snapshot_error)
    }

    fn release(self: Box<Self>) {
        let mut ledger = self.ledger.write();

        // a newer snapshot or a restore owns truncation now
        if self.current_seq.load(Ordering::SeqCst) != self.seq {
            tracing::debug!(seq = self.seq, "stale snapshot released without compaction");
            return;
        }

        let boundary = self.preamble.boundary.min(ledger.log.len());
        ledger.log.drain(..boundary);
        tracing::debug!(seq = self.seq, dropped = boundary, retained = ledger.log.len(), "log compacted");
    }
}
