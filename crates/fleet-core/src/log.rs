//! # log
//!
//! why: the unit the consensus engine replicates and hands to the state machine
//! relations: produced by the engine, consumed by the replicated log's apply
//! what: LogEntry struct, EntryKind

use serde::{Deserialize, Serialize};

/// What a committed entry carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EntryKind {
    /// an encoded message for the state machine
    #[default]
    Command,
    /// leader no-op written at the start of a term
    Noop,
    /// voter set change
    Configuration,
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    #[serde(default)]
    pub kind: EntryKind,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new command entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, kind: EntryKind::Command, command }
    }

    /// Create an entry with no payload
    pub fn control(term: u64, index: u64, kind: EntryKind) -> Self {
        Self { term, index, kind, command: Vec::new() }
    }

    /// only committed command entries carry a payload worth applying
    pub fn has_payload(&self) -> bool {
        self.kind == EntryKind::Command && !self.command.is_empty()
    }
}
