//! Snapshot persistence for the subscription store.
//!
//! The whole [`StoreData`] is written as one JSON document. Leases and tokens
//! must be durable before a callback is issued, so every mutation rewrites
//! the snapshot before the store lock is released.
//!
//! # Atomic Writes
//!
//! Snapshots are written atomically using a write-to-temp-then-rename pattern:
//! 1. Write to `<path>.tmp`
//! 2. fsync the file
//! 3. Rename to `<path>`
//! 4. fsync the directory
//!
//! Readers always see either the old or the new snapshot, never a partial write.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use super::data::{SCHEMA_VERSION, StoreData};
use super::{Result, StoreError};

/// Syncs a directory so that a rename inside it survives power loss.
fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Saves the store snapshot atomically to disk.
///
/// # Errors
///
/// Returns an error if any IO operation fails.
pub fn save_snapshot_atomic(path: &Path, data: &StoreData) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = tmp_path(path);
    let bytes = serde_json::to_vec_pretty(data)?;

    {
        let mut file: File = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp, path)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fsync_dir(parent)?;
    }

    Ok(())
}

/// Loads a snapshot from disk.
///
/// # Errors
///
/// Returns an error if:
/// - The file doesn't exist or can't be read
/// - The JSON is malformed
/// - The schema version is incompatible
pub fn load_snapshot(path: &Path) -> Result<StoreData> {
    let bytes = std::fs::read(path)?;
    let data: StoreData = serde_json::from_slice(&bytes)?;

    if data.schema_version != SCHEMA_VERSION {
        return Err(StoreError::SchemaMismatch {
            expected: SCHEMA_VERSION,
            got: data.schema_version,
        });
    }

    Ok(data)
}

/// Attempts to load a snapshot, returning None if the file doesn't exist.
///
/// Other errors (malformed JSON, schema mismatch) are propagated.
pub fn try_load_snapshot(path: &Path) -> Result<Option<StoreData>> {
    match load_snapshot(path) {
        Ok(data) => Ok(Some(data)),
        Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
