//! # message
//!
//! why: define the envelope every replicated or observed event travels in
//! relations: encoded into consensus log entries, replayed by the wal, pushed to watchers
//! what: Message envelope, Event variants, DeployCommand, Archive, DeployOptions

use crate::peer::Peer;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// An uploaded deployment archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    /// identifier shared by every replica that refers to this upload
    pub deployment_id: String,
    /// hex encoded sha256 of the archive contents
    pub checksum: String,
    /// where the archive storage placed the bytes
    pub location: String,
    pub bytes: u64,
    /// who requested the upload
    #[serde(default)]
    pub initiator: String,
    /// peer that accepted the upload
    #[serde(default)]
    pub peer: Option<Peer>,
    /// unix millis of the upload
    #[serde(default)]
    pub ts: i64,
}

/// How a deploy is driven across the fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOptions {
    /// number of peers deployed to at once
    pub concurrency: u64,
    /// abort after this many seconds without progress
    pub timeout_secs: u64,
    /// keep going when individual peers fail
    pub ignore_failures: bool,
    /// suppress per-peer log output
    pub silent: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self { concurrency: 1, timeout_secs: 300, ignore_failures: false, silent: false }
    }
}

/// Deployment lifecycle command replicated through the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DeployCommand {
    Begin { archive: Archive, options: DeployOptions },
    Done { archive: Archive, options: DeployOptions },
    Failed { archive: Archive, options: DeployOptions },
    Cancel { initiator: String },
    Restart { initiator: String },
}

impl DeployCommand {
    pub fn begin(archive: Archive, options: DeployOptions) -> Self {
        DeployCommand::Begin { archive, options }
    }

    pub fn done(archive: Archive, options: DeployOptions) -> Self {
        DeployCommand::Done { archive, options }
    }

    pub fn failed(archive: Archive, options: DeployOptions) -> Self {
        DeployCommand::Failed { archive, options }
    }

    pub fn cancel(initiator: impl Into<String>) -> Self {
        DeployCommand::Cancel { initiator: initiator.into() }
    }

    pub fn restart(initiator: impl Into<String>) -> Self {
        DeployCommand::Restart { initiator: initiator.into() }
    }

    /// short lowercase name, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            DeployCommand::Begin { .. } => "begin",
            DeployCommand::Done { .. } => "done",
            DeployCommand::Failed { .. } => "failed",
            DeployCommand::Cancel { .. } => "cancel",
            DeployCommand::Restart { .. } => "restart",
        }
    }

    pub fn archive(&self) -> Option<&Archive> {
        match self {
            DeployCommand::Begin { archive, .. }
            | DeployCommand::Done { archive, .. }
            | DeployCommand::Failed { archive, .. } => Some(archive),
            DeployCommand::Cancel { .. } | DeployCommand::Restart { .. } => None,
        }
    }

    pub fn options(&self) -> Option<&DeployOptions> {
        match self {
            DeployCommand::Begin { options, .. }
            | DeployCommand::Done { options, .. }
            | DeployCommand::Failed { options, .. } => Some(options),
            DeployCommand::Cancel { .. } | DeployCommand::Restart { .. } => None,
        }
    }

    pub fn is_begin(&self) -> bool {
        matches!(self, DeployCommand::Begin { .. })
    }

    /// done and failed end a deploy on their own
    pub fn is_completion(&self) -> bool {
        matches!(self, DeployCommand::Done { .. } | DeployCommand::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerEventKind {
    Joined,
    Left,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEvent {
    pub kind: PeerEventKind,
    pub peer: Peer,
}

/// Credential material generated by the certificate authority bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityEvent {
    pub fingerprint: String,
    pub certificate: String,
    pub private_key: String,
}

/// Ephemeral integer counter, e.g. deploy progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterEvent {
    pub name: String,
    pub value: i64,
}

/// Batch of previously observed messages handed to a new watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    Log(LogEvent),
    Deploy(DeployCommand),
    Peer(PeerEvent),
    Authority(AuthorityEvent),
    Counter(CounterEvent),
    History(HistoryEvent),
}

/// The envelope around every event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// monotonic within the originating process
    pub id: u64,
    pub origin: Peer,
    /// unix millis at creation
    pub ts: i64,
    /// never replayed to live observers
    #[serde(default)]
    pub hidden: bool,
    /// applied but never appended to the replay log
    #[serde(default)]
    pub disallow_wal: bool,
    pub event: Event,
}

impl Message {
    pub fn new(origin: Peer, event: Event) -> Self {
        Self {
            id: next_id(),
            origin,
            ts: now_millis(),
            hidden: false,
            disallow_wal: false,
            event,
        }
    }

    pub fn log(origin: Peer, text: impl Into<String>) -> Self {
        Self::new(origin, Event::Log(LogEvent { text: text.into() }))
    }

    pub fn deploy(origin: Peer, command: DeployCommand) -> Self {
        Self::new(origin, Event::Deploy(command))
    }

    pub fn peer(origin: Peer, kind: PeerEventKind, peer: Peer) -> Self {
        Self::new(origin, Event::Peer(PeerEvent { kind, peer }))
    }

    pub fn authority(origin: Peer, authority: AuthorityEvent) -> Self {
        Self::new(origin, Event::Authority(authority)).hidden()
    }

    /// counters are ephemeral and never land in the wal
    pub fn counter(origin: Peer, name: impl Into<String>, value: i64) -> Self {
        Self::new(origin, Event::Counter(CounterEvent { name: name.into(), value })).disallow_wal()
    }

    pub fn history(origin: Peer, messages: Vec<Message>) -> Self {
        Self::new(origin, Event::History(HistoryEvent { messages }))
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn disallow_wal(mut self) -> Self {
        self.disallow_wal = true;
        self
    }

    pub fn deploy_command(&self) -> Option<&DeployCommand> {
        match &self.event {
            Event::Deploy(command) => Some(command),
            _ => None,
        }
    }

    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// current unix time in milliseconds
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// process-wide monotonic id, also used to name uploads
///
/// wall clock nanos, bumped past the last issued id so ids never repeat or go backwards
pub fn next_id() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();

    let mut last = LAST_ID.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_ID.compare_exchange_weak(last, candidate, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive() -> Archive {
        Archive {
            deployment_id: "dep-1".into(),
            checksum: "abc".into(),
            location: "/tmp/dep-1".into(),
            bytes: 10,
            initiator: "alice".into(),
            peer: None,
            ts: 0,
        }
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let origin = Peer::loopback("node-1");
        let a = Message::log(origin.clone(), "a");
        let b = Message::log(origin, "b");
        assert!(b.id > a.id);
    }

    #[test]
    fn counters_skip_the_wal() {
        let msg = Message::counter(Peer::loopback("node-1"), "progress", 3);
        assert!(msg.disallow_wal);
        assert!(!msg.hidden);
    }

    #[test]
    fn deploy_command_accessors() {
        let begin = DeployCommand::begin(archive(), DeployOptions::default());
        assert_eq!(begin.name(), "begin");
        assert_eq!(begin.archive().map(|a| a.deployment_id.as_str()), Some("dep-1"));
        assert!(begin.is_begin());
        assert!(!begin.is_completion());

        let cancel = DeployCommand::cancel("bob");
        assert!(cancel.archive().is_none());
        assert!(cancel.options().is_none());
    }

    #[test]
    fn envelope_survives_encoding() {
        let msg = Message::deploy(
            Peer::loopback("node-1"),
            DeployCommand::done(archive(), DeployOptions::default()),
        );
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }
}
