//! Whole-file JSON persistence for metadata and the recovery journal.
//!
//! Files are small and rewritten wholesale: the new content goes to a
//! temporary file in the same directory which is then renamed over the
//! target, so readers see either the old or the new version.

use crate::core::{ProxyError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Serializes `value` and atomically replaces `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| {
        ProxyError::IoError(format!("Failed to create directory {}: {}", dir.display(), e))
    })?;

    let json = serde_json::to_vec_pretty(value)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| ProxyError::IoError(format!("Failed to create temp file: {}", e)))?;
    temp.write_all(&json)
        .map_err(|e| ProxyError::IoError(format!("Failed to write {}: {}", path.display(), e)))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| ProxyError::IoError(format!("Failed to sync {}: {}", path.display(), e)))?;
    temp.persist(path)
        .map_err(|e| ProxyError::IoError(format!("Failed to replace {}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Reads and parses `path`; `None` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ProxyError::IoError(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )));
        }
    };
    let value = serde_json::from_slice(&bytes)?;
    Ok(Some(value))
}
