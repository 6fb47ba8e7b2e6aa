//! Atomic JSON file writes.
//!
//! Invariants:
//! - A target path only ever holds a complete document (write-then-rename)
//! - Temp files live next to the target so the rename never crosses filesystems
//! - Temp files end in `.tmp` and are ignored by every `*.json` listing

use crate::models::{PerduraError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Outcome of reading a JSON document that may be absent or damaged.
#[derive(Debug)]
pub enum JsonRead<T> {
    Found(T),
    Missing,
    Corrupt(String),
}

/// Serialize `value` and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let temp_path = temp_path_for(path);

    let result = write_temp(&temp_path, value).and_then(|()| {
        fs::rename(&temp_path, path).map_err(|e| PerduraError::io("renaming temp file", e))
    });

    if result.is_err() {
        // Leftover temp files are harmless but noisy.
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    sync_parent(path);
    debug!(path = %path.display(), "Atomic write complete");
    Ok(())
}

/// Write a document to a fresh path, refusing to overwrite an existing file.
pub fn write_json_new<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| PerduraError::io(format!("creating {}", path.display()), e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| PerduraError::serialization("writing document", e))?;
    writer
        .flush()
        .map_err(|e| PerduraError::io("flushing document", e))?;
    Ok(())
}

/// Read a JSON document, separating "not there" from "unreadable".
pub fn read_json<T: DeserializeOwned>(path: &Path) -> JsonRead<T> {
    let content = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return JsonRead::Missing,
        Err(e) => return JsonRead::Corrupt(format!("unreadable: {e}")),
    };

    match serde_json::from_slice(&content) {
        Ok(value) => JsonRead::Found(value),
        Err(e) => JsonRead::Corrupt(format!("invalid JSON: {e}")),
    }
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(PerduraError::io(format!("removing {}", path.display()), e)),
    }
}

/// Make a task name safe to use as a file stem.
pub fn sanitize_file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "_".to_string()
    } else {
        stem
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()))
}

fn write_temp<T: Serialize>(temp_path: &Path, value: &T) -> Result<()> {
    let file =
        File::create(temp_path).map_err(|e| PerduraError::io("creating temp file", e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| PerduraError::serialization("serializing document", e))?;
    writer
        .flush()
        .map_err(|e| PerduraError::io("flushing temp file", e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| PerduraError::io("syncing temp file", e))?;
    Ok(())
}

fn sync_parent(path: &Path) {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                // Best effort: the rename itself already happened.
                let _ = dir.sync_all();
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
