//! # authority
//!
//! why: credential material broadcast through the log must survive compaction
//! relations: third stage of the wal chain; fed by the authority bootstrap; writes a snapshot trailer
//! what: AuthorityTranscoder
//!
//! Every replica keeps the newest authority event, optionally writes it to
//! disk, and carries it across compaction in the snapshot trailer.

use super::transcoder::{ApplyContext, Transcoder};
use super::Ledger;
use fleet_core::codec;
use fleet_core::{AuthorityEvent, Event, Message, Result};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct AuthorityTranscoder {
    dir: Option<PathBuf>,
    current: Mutex<Option<Message>>,
}

impl AuthorityTranscoder {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir, current: Mutex::new(None) }
    }

    /// newest credential material seen in the log
    pub fn current(&self) -> Option<AuthorityEvent> {
        match self.current.lock().as_ref().map(|m| &m.event) {
            Some(Event::Authority(authority)) => Some(authority.clone()),
            _ => None,
        }
    }

    fn persist(dir: &Path, authority: &AuthorityEvent) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.pem", authority.fingerprint));
        let temp_path = dir.join(format!("{}.pem.tmp", authority.fingerprint));

        // atomic write: write to temp file then rename
        let mut file = File::create(&temp_path)?;
        file.write_all(authority.certificate.as_bytes())?;
        if !authority.certificate.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.write_all(authority.private_key.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;

        tracing::info!(fingerprint = %authority.fingerprint, path = %path.display(), "credential authority persisted");
        Ok(())
    }
}

impl Transcoder for AuthorityTranscoder {
    fn decode(&self, _ctx: &ApplyContext, _ledger: &mut Ledger, message: &Message) -> Result<()> {
        let Event::Authority(authority) = &message.event else {
            return Ok(());
        };

        if let Some(dir) = &self.dir {
            Self::persist(dir, authority)?;
        }

        *self.current.lock() = Some(message.clone());
        Ok(())
    }

    fn encode(&self, sink: &mut dyn Write) -> Result<()> {
        if let Some(message) = self.current.lock().clone() {
            codec::write_json(sink, &message.disallow_wal())?;
        }
        Ok(())
    }

    fn reset(&self) {
        *self.current.lock() = None;
    }
}
