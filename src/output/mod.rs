//! Output layout and durable file helpers

use std::io::Write;
use std::path::Path;

pub mod path;

pub use path::{ledger_path, run_report_path, RunLayout};

/// Output errors
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Atomically replace `path` with `contents`.
///
/// Writes to a temp file in the same directory, syncs it, renames it over the
/// target and finally syncs the parent directory so the rename survives a crash.
pub fn write_atomic(path: &Path, contents: &[u8]) -> OutputResult<()> {
    let parent_dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent_dir)
        .map_err(|e| OutputError::IoError(format!("Failed to create {}: {e}", parent_dir.display())))?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
        .map_err(|e| OutputError::IoError(format!("Failed to create temp file: {e}")))?;
    temp_file
        .write_all(contents)
        .map_err(|e| OutputError::IoError(format!("Failed to write to temp file: {e}")))?;
    temp_file
        .flush()
        .map_err(|e| OutputError::IoError(format!("Failed to flush temp file: {e}")))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| OutputError::IoError(format!("Failed to sync temp file: {e}")))?;
    temp_file
        .persist(path)
        .map_err(|e| OutputError::IoError(format!("Failed to persist temp file: {e}")))?;

    sync_dir(parent_dir);
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> OutputResult<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| OutputError::SerializationError(e.to_string()))?;
    write_atomic(path, &json)
}

/// Best-effort fsync of a directory so renames inside it are durable.
pub fn sync_dir(dir: &Path) {
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// Sanitize a single path component for filesystem safety
///
/// Prevents path traversal by replacing dangerous characters:
/// - `/`, `\`, `:` → `_` (directory separators)
/// - `..` → `__` (parent directory reference)
///
/// Preserves case.
pub fn sanitize_component(name: &str) -> String {
    let cleaned = name.replace("..", "__").replace(['/', '\\', ':'], "_");
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
