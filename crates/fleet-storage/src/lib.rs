//! # fleet-storage
//!
//! why: durable persistence for replicated log snapshots using standard rust fs apis
//! relations: snapshots are produced by fleet-replica's replicated log, read back on restore
//! what: SnapshotStore/SnapshotSink traits, FileSnapshotStore, InMemorySnapshotStore for testing

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// what is known about a persisted snapshot without reading it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    /// last consensus index covered by the snapshot
    pub index: u64,
    /// term of that index
    pub term: u64,
    /// bytes written by the state machine
    pub size: u64,
    pub created_ms: i64,
}

/// trait for durable storage of state machine snapshots
///
/// this abstraction allows the same code to work with:
/// - real filesystem (native)
/// - in-memory (testing and simulations)
pub trait SnapshotStore: Send + Sync {
    /// begin a new snapshot covering the log up to `index`
    fn create(&self, index: u64, term: u64) -> io::Result<Box<dyn SnapshotSink>>;

    /// completed snapshots, newest first
    fn list(&self) -> io::Result<Vec<SnapshotMeta>>;

    /// open a completed snapshot for reading
    fn open(&self, id: &str) -> io::Result<(SnapshotMeta, Box<dyn Read + Send>)>;

    /// open the newest completed snapshot, if any
    fn latest(&self) -> io::Result<Option<(SnapshotMeta, Box<dyn Read + Send>)>> {
        match self.list()?.into_iter().next() {
            Some(meta) => self.open(&meta.id).map(Some),
            None => Ok(None),
        }
    }

    /// drop every snapshot (for testing)
    fn clear(&self) -> io::Result<()>;
}

/// a snapshot being written; nothing is visible to readers until `close`
pub trait SnapshotSink: Write + Send {
    fn id(&self) -> &str;

    /// make the snapshot durable and visible
    fn close(self: Box<Self>) -> io::Result<SnapshotMeta>;

    /// discard everything written so far
    fn cancel(self: Box<Self>) -> io::Result<()>;
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn snapshot_id(term: u64, index: u64, seq: u64) -> String {
    format!("{}-{}-{}-{}", term, index, now_millis(), seq)
}

// newest first: highest index, then term, then creation order
fn sort_newest_first(metas: &mut [SnapshotMeta]) {
    metas.sort_by(|a, b| {
        (b.index, b.term, b.created_ms, &b.id).cmp(&(a.index, a.term, a.created_ms, &a.id))
    });
}

// -- file storage implementation --

/// file-based snapshot store using std::fs
///
/// stores each snapshot in its own directory:
/// - meta.json: SnapshotMeta
/// - state.bin: the bytes written by the state machine
///
/// snapshots are written into `<id>.tmp` and renamed into place on close.
pub struct FileSnapshotStore {
    /// directory path for storing snapshot directories
    dir: PathBuf,
    /// how many completed snapshots to keep
    retain: usize,
    seq: AtomicU64,
}

impl FileSnapshotStore {
    /// create a new store at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, retain: retain.max(1), seq: AtomicU64::new(0) })
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(id).join("meta.json")
    }

    fn state_path(&self, id: &str) -> PathBuf {
        self.dir.join(id).join("state.bin")
    }

    /// remove completed snapshots beyond the retention limit
    fn reap(dir: &Path, retain: usize) -> io::Result<()> {
        let mut metas = Self::scan(dir)?;
        sort_newest_first(&mut metas);
        for meta in metas.into_iter().skip(retain) {
            tracing::debug!(id = %meta.id, "reaping old snapshot");
            fs::remove_dir_all(dir.join(&meta.id))?;
        }
        Ok(())
    }

    fn scan(dir: &Path) -> io::Result<Vec<SnapshotMeta>> {
        let mut metas = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.file_type()?.is_dir() || name.ends_with(".tmp") {
                continue;
            }

            let path = entry.path().join("meta.json");
            if !path.exists() {
                continue;
            }

            let contents = fs::read_to_string(&path)?;
            let meta: SnapshotMeta = serde_json::from_str(&contents)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            metas.push(meta);
        }
        Ok(metas)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn create(&self, index: u64, term: u64) -> io::Result<Box<dyn SnapshotSink>> {
        let id = snapshot_id(term, index, self.seq.fetch_add(1, Ordering::SeqCst));
        let temp_dir = self.dir.join(format!("{}.tmp", id));
        fs::create_dir_all(&temp_dir)?;
        let file = File::create(temp_dir.join("state.bin"))?;

        Ok(Box::new(FileSnapshotSink {
            meta: SnapshotMeta { id, index, term, size: 0, created_ms: now_millis() },
            dir: self.dir.clone(),
            temp_dir,
            writer: BufWriter::new(file),
            retain: self.retain,
        }))
    }

    fn list(&self) -> io::Result<Vec<SnapshotMeta>> {
        let mut metas = Self::scan(&self.dir)?;
        sort_newest_first(&mut metas);
        Ok(metas)
    }

    fn open(&self, id: &str) -> io::Result<(SnapshotMeta, Box<dyn Read + Send>)> {
        let contents = fs::read_to_string(self.meta_path(id))?;
        let meta: SnapshotMeta = serde_json::from_str(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let file = File::open(self.state_path(id))?;
        Ok((meta, Box::new(io::BufReader::new(file))))
    }

    fn clear(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }
}

struct FileSnapshotSink {
    meta: SnapshotMeta,
    dir: PathBuf,
    temp_dir: PathBuf,
    writer: BufWriter<File>,
    retain: usize,
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.meta.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn close(self: Box<Self>) -> io::Result<SnapshotMeta> {
        let FileSnapshotSink { meta, dir, temp_dir, writer, retain } = *self;

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut meta_file = File::create(temp_dir.join("meta.json"))?;
        meta_file.write_all(json.as_bytes())?;
        meta_file.sync_all()?;

        // atomic publish: the directory only appears under its final name once complete
        fs::rename(&temp_dir, dir.join(&meta.id))?;
        FileSnapshotStore::reap(&dir, retain)?;

        tracing::info!(id = %meta.id, index = meta.index, size = meta.size, "snapshot persisted");
        Ok(meta)
    }

    fn cancel(self: Box<Self>) -> io::Result<()> {
        tracing::debug!(id = %self.meta.id, "snapshot cancelled");
        let temp_dir = self.temp_dir.clone();
        drop(self);
        fs::remove_dir_all(temp_dir)
    }
}

// -- in-memory storage implementation --

type Completed = Arc<Mutex<Vec<(SnapshotMeta, Vec<u8>)>>>;

fn poisoned<T>(_: T) -> io::Error {
    io::Error::new(io::ErrorKind::Other, "snapshot store lock poisoned")
}

/// in-memory snapshot store for testing
///
/// stores all snapshots in memory, no persistence across process restarts.
/// clones share the same snapshots.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    completed: Completed,
    seq: Arc<AtomicU64>,
}

impl InMemorySnapshotStore {
    /// create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn create(&self, index: u64, term: u64) -> io::Result<Box<dyn SnapshotSink>> {
        let id = snapshot_id(term, index, self.seq.fetch_add(1, Ordering::SeqCst));
        Ok(Box::new(InMemorySnapshotSink {
            meta: SnapshotMeta { id, index, term, size: 0, created_ms: now_millis() },
            buf: Vec::new(),
            completed: Arc::clone(&self.completed),
        }))
    }

    fn list(&self) -> io::Result<Vec<SnapshotMeta>> {
        let completed = self.completed.lock().map_err(poisoned)?;
        let mut metas: Vec<SnapshotMeta> = completed.iter().map(|(meta, _)| meta.clone()).collect();
        sort_newest_first(&mut metas);
        Ok(metas)
    }

    fn open(&self, id: &str) -> io::Result<(SnapshotMeta, Box<dyn Read + Send>)> {
        let completed = self.completed.lock().map_err(poisoned)?;
        completed
            .iter()
            .find(|(meta, _)| meta.id == id)
            .map(|(meta, data)| {
                let reader: Box<dyn Read + Send> = Box::new(Cursor::new(data.clone()));
                (meta.clone(), reader)
            })
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("snapshot {} not found", id)))
    }

    fn clear(&self) -> io::Result<()> {
        self.completed.lock().map_err(poisoned)?.clear();
        Ok(())
    }
}

struct InMemorySnapshotSink {
    meta: SnapshotMeta,
    buf: Vec<u8>,
    completed: Completed,
}

impl Write for InMemorySnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        self.meta.size += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for InMemorySnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn close(self: Box<Self>) -> io::Result<SnapshotMeta> {
        let InMemorySnapshotSink { meta, buf, completed } = *self;
        completed.lock().map_err(poisoned)?.push((meta.clone(), buf));
        Ok(meta)
    }

    fn cancel(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}
