//! Append-only ledger of completed exports
//!
//! One JSON object per line. Loading compacts the file: duplicate entries for
//! the same project collapse to the first one and torn lines from a crash are
//! dropped, after which the file is rewritten atomically. Appends go through a
//! single writer task that syncs each line before acknowledging it.

use super::lock::LedgerLock;
use super::{LedgerError, LedgerResult};
use crate::output::write_atomic;
use crate::{ProjectKey, ProjectRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Current ledger line format
pub const LEDGER_VERSION: u32 = 1;

/// Pending appends buffered in front of the writer task
const WRITER_QUEUE_CAPACITY: usize = 64;

/// One completed export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Line format version
    pub version: u32,
    /// Exported project
    pub project: ProjectRef,
    /// Completion time
    pub completed_at: DateTime<Utc>,
    /// Lowercase hex SHA-256 of the archive
    pub archive_checksum: String,
    /// Archive size in bytes
    #[serde(default)]
    pub bytes: u64,
}

impl LedgerEntry {
    /// Entry for an archive completed now
    pub fn new(project: ProjectRef, archive_checksum: impl Into<String>, bytes: u64) -> Self {
        Self {
            version: LEDGER_VERSION,
            project,
            completed_at: Utc::now(),
            archive_checksum: archive_checksum.into(),
            bytes,
        }
    }
}

/// What loading found in the file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    /// Distinct completed projects
    pub entries: usize,
    /// Entries dropped because an earlier line had the same project
    pub duplicates: usize,
    /// Lines that were not valid entries
    pub torn_lines: usize,
}

impl LedgerStats {
    /// Whether the file needs rewriting
    pub fn needs_compaction(&self) -> bool {
        self.duplicates > 0 || self.torn_lines > 0
    }
}

struct Loaded {
    entries: Vec<LedgerEntry>,
    completed: HashSet<ProjectKey>,
    stats: LedgerStats,
}

fn load(path: &Path) -> LedgerResult<Loaded> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(LedgerError::IoError(format!("{}: {e}", path.display())));
        }
    };

    let mut entries = Vec::new();
    let mut completed = HashSet::new();
    let mut stats = LedgerStats::default();

    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => {
                if completed.insert(entry.project.key()) {
                    entries.push(entry);
                } else {
                    stats.duplicates += 1;
                }
            }
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "Ignoring unreadable ledger line");
                stats.torn_lines += 1;
            }
        }
    }

    stats.entries = entries.len();
    Ok(Loaded {
        entries,
        completed,
        stats,
    })
}

fn encode_line(entry: &LedgerEntry) -> LedgerResult<Vec<u8>> {
    let mut line = serde_json::to_vec(entry)
        .map_err(|e| LedgerError::SerializationError(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

/// Loaded, locked ledger
#[derive(Debug)]
pub struct ResumeLedger {
    path: PathBuf,
    lock: LedgerLock,
    entries: Vec<LedgerEntry>,
    completed: HashSet<ProjectKey>,
    stats: LedgerStats,
}

impl ResumeLedger {
    /// Lock, load and compact the ledger at `path`.
    ///
    /// # Errors
    /// `LedgerError::Locked` if another run holds the ledger.
    pub fn open(path: impl Into<PathBuf>) -> LedgerResult<Self> {
        let path = path.into();
        let lock = LedgerLock::try_acquire(&path)?;
        let Loaded {
            entries,
            completed,
            stats,
        } = load(&path)?;

        if stats.needs_compaction() {
            let mut compacted = Vec::new();
            for entry in &entries {
                compacted.extend(encode_line(entry)?);
            }
            write_atomic(&path, &compacted).map_err(|e| LedgerError::IoError(e.to_string()))?;
            info!(
                path = %path.display(),
                duplicates = stats.duplicates,
                torn_lines = stats.torn_lines,
                "Compacted resume ledger"
            );
        }

        debug!(path = %path.display(), entries = stats.entries, "Loaded resume ledger");
        Ok(Self {
            path,
            lock,
            entries,
            completed,
            stats,
        })
    }

    /// Read the ledger without locking or rewriting it.
    pub fn inspect(path: &Path) -> LedgerResult<LedgerStats> {
        Ok(load(path)?.stats)
    }

    /// Ledger file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keys of completed projects
    pub fn completed(&self) -> &HashSet<ProjectKey> {
        &self.completed
    }

    /// Whether `key` was completed by an earlier run
    pub fn is_completed(&self, key: &ProjectKey) -> bool {
        self.completed.contains(key)
    }

    /// Entries in file order
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Load statistics
    pub fn stats(&self) -> LedgerStats {
        self.stats
    }

    /// Start the writer task. Must be called within a tokio runtime.
    pub async fn into_writer(self) -> LedgerResult<LedgerWriter> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| LedgerError::IoError(format!("{}: {e}", self.path.display())))?;

        let (tx, rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
        let task = tokio::spawn(writer_loop(file, self.completed, rx, self.lock));

        Ok(LedgerWriter {
            handle: LedgerHandle { tx },
            task,
        })
    }
}

enum Command {
    Append(LedgerEntry, oneshot::Sender<LedgerResult<bool>>),
    Close,
}

async fn writer_loop(
    mut file: tokio::fs::File,
    mut known: HashSet<ProjectKey>,
    mut rx: mpsc::Receiver<Command>,
    _lock: LedgerLock,
) -> LedgerResult<()> {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Append(entry, ack) => {
                let result = if known.contains(&entry.project.key()) {
                    Ok(false)
                } else {
                    match append_line(&mut file, &entry).await {
                        Ok(()) => {
                            known.insert(entry.project.key());
                            Ok(true)
                        }
                        Err(e) => Err(e),
                    }
                };
                let _ = ack.send(result);
            }
            Command::Close => break,
        }
    }
    file.sync_all()
        .await
        .map_err(|e| LedgerError::IoError(e.to_string()))?;
    Ok(())
}

async fn append_line(file: &mut tokio::fs::File, entry: &LedgerEntry) -> LedgerResult<()> {
    let line = encode_line(entry)?;
    file.write_all(&line)
        .await
        .map_err(|e| LedgerError::IoError(format!("ledger write failed: {e}")))?;
    file.flush()
        .await
        .map_err(|e| LedgerError::IoError(format!("ledger flush failed: {e}")))?;
    file.sync_data()
        .await
        .map_err(|e| LedgerError::IoError(format!("ledger sync failed: {e}")))?;
    Ok(())
}

/// Cloneable sender side of the writer task
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<Command>,
}

impl LedgerHandle {
    /// Durably append `entry`.
    ///
    /// Returns `false` when the project was already recorded. Resolves only
    /// after the line has been synced to disk.
    pub async fn append(&self, entry: LedgerEntry) -> LedgerResult<bool> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Append(entry, ack_tx))
            .await
            .map_err(|_| LedgerError::WriterClosed)?;
        ack_rx.await.map_err(|_| LedgerError::WriterClosed)?
    }
}

/// Owner of the writer task
#[derive(Debug)]
pub struct LedgerWriter {
    handle: LedgerHandle,
    task: JoinHandle<LedgerResult<()>>,
}

impl LedgerWriter {
    /// Handle for job runners
    pub fn handle(&self) -> LedgerHandle {
        self.handle.clone()
    }

    /// Drain queued appends, sync the file and release the lock.
    pub async fn close(self) -> LedgerResult<()> {
        // A send error means the task already exited; its result is below.
        let _ = self.handle.tx.send(Command::Close).await;
        self.task
            .await
            .map_err(|e| LedgerError::IoError(format!("ledger writer panicked: {e}")))?
    }
}
