//! Filesystem probes.
//!
//! The marker file, the key file and the decrypted container's mount point
//! are all shared with the rest of the system, so every answer here is a
//! snapshot and may be stale by the time the caller acts on it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// What currently lives at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Missing,
    File,
    Directory,
}

/// Reports whether `path` is a file, a directory, or absent.
///
/// Unreadable paths count as missing.
pub fn probe(path: &Path) -> PathKind {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => PathKind::Directory,
        Ok(_) => PathKind::File,
        Err(_) => PathKind::Missing,
    }
}

/// Returns true if `path` is an existing regular file (or symlink to one).
pub fn is_file(path: &Path) -> bool {
    probe(path) == PathKind::File
}

/// Returns true if `path` is an existing directory.
pub fn is_dir(path: &Path) -> bool {
    probe(path) == PathKind::Directory
}

/// Lists the non-hidden entries of `dir`, sorted by name.
///
/// Entries whose name starts with `.` are skipped. Returns `Ok(None)` when the
/// directory does not exist.
pub fn visible_entries(dir: &Path) -> std::io::Result<Option<Vec<PathBuf>>> {
    let reader = match fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut entries = Vec::new();
    for entry in reader {
        let entry = entry?;
        if is_hidden(&entry.file_name().to_string_lossy()) {
            continue;
        }
        entries.push(entry.path());
    }
    entries.sort();
    Ok(Some(entries))
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}
