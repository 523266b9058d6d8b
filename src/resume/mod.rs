//! Resume capability for export runs
//!
//! A run records every verified archive in an append-only JSONL ledger under
//! the output root. The next run loads the ledger and skips those projects.

pub mod ledger;
pub mod lock;

pub use ledger::{LedgerEntry, LedgerHandle, LedgerStats, LedgerWriter, ResumeLedger, LEDGER_VERSION};
pub use lock::LedgerLock;

/// Ledger errors
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Another run holds the ledger lock
    #[error("ledger is locked by another run ({0})")]
    Locked(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Entry could not be encoded
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Writer task is gone
    #[error("ledger writer closed")]
    WriterClosed,
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
