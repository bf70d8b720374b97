//! Snapshot persistence: one opaque blob on disk.
//!
//! The file holds the document's full state-as-update, raw, with no header
//! or versioning. It is rewritten from scratch after every applied remote
//! update and read back exactly once at startup. A missing file is a fresh
//! start; whether the bytes still decode is the caller's problem (a corrupt
//! blob is logged upstream and likewise treated as a fresh start).

use std::fs;
use std::io;
use std::path::Path;

/// Default snapshot location, relative to the working directory.
pub const DEFAULT_SNAPSHOT_PATH: &str = "crdt_document.bin";

/// Read the persisted snapshot. `Ok(None)` when the file does not exist or
/// is empty; both mean "start fresh".
pub fn load(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(blob) if blob.is_empty() => Ok(None),
        Ok(blob) => Ok(Some(blob)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Replace the snapshot with `blob`.
///
/// Writes a sibling temp file and renames it over the target, so a crash
/// mid-write leaves the previous snapshot intact rather than a truncated
/// one.
pub fn save(path: &Path, blob: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, blob)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
