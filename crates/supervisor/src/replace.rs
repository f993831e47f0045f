//! File-system collaborator: swapping a finished output into place.
//!
//! The original is first renamed to `ORIG.<name>` so a failed swap can be
//! undone; afterwards the backup is kept or removed depending on config.
//! Access and modification times of the original are carried over to the
//! new file.

use filetime::FileTime;
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix of the backup kept for a replaced original.
pub const BACKUP_PREFIX: &str = "ORIG.";

/// Errors that can occur during file replacement.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Failed to move the original out of the way.
    #[error("Failed to create backup: {0}")]
    BackupFailed(io::Error),

    /// Failed to rename the new output into place.
    #[error("Failed to rename output into place: {0}")]
    RenameFailed(io::Error),
}

/// Access and modification times captured from a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub accessed: FileTime,
    pub modified: FileTime,
}

/// Read the timestamps of `path`.
pub fn preserve_timestamps(path: &Path) -> io::Result<Timestamps> {
    let meta = fs::metadata(path)?;
    Ok(Timestamps {
        accessed: FileTime::from_last_access_time(&meta),
        modified: FileTime::from_last_modification_time(&meta),
    })
}

/// Stamp `path` with previously captured timestamps.
pub fn apply_timestamps(path: &Path, timestamps: Timestamps) -> io::Result<()> {
    filetime::set_file_times(path, timestamps.accessed, timestamps.modified)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn sibling(path: &Path, name: String) -> PathBuf {
    path.parent().map_or_else(|| PathBuf::from(&name), |dir| dir.join(&name))
}

/// Backup location for `original`: `ORIG.<name>` in the same directory.
pub fn backup_path(original: &Path) -> PathBuf {
    sibling(original, format!("{}{}", BACKUP_PREFIX, file_name(original)))
}

/// Replace `original` with `output`, which ends up at `standard`.
///
/// Returns the operations performed, one line each. If the output cannot be
/// renamed into place the original is restored and an error is returned.
pub fn swap_into_place(
    original: &Path,
    output: &Path,
    standard: &Path,
    keep_backup: bool,
) -> Result<Vec<String>, ReplaceError> {
    let mut ops = Vec::new();

    let timestamps = match preserve_timestamps(original) {
        Ok(ts) => Some(ts),
        Err(e) => {
            debug!("no timestamps for {}: {}", original.display(), e);
            None
        }
    };

    let backup = backup_path(original);
    fs::rename(original, &backup).map_err(ReplaceError::BackupFailed)?;
    ops.push(format!("rename {:?} {:?}", file_name(original), file_name(&backup)));

    if let Err(e) = fs::rename(output, standard) {
        if let Err(restore) = fs::rename(&backup, original) {
            warn!(
                "could not restore {} from {}: {}",
                original.display(),
                backup.display(),
                restore
            );
        }
        return Err(ReplaceError::RenameFailed(e));
    }
    ops.push(format!("rename {:?} {:?}", file_name(output), file_name(standard)));

    if !keep_backup {
        match fs::remove_file(&backup) {
            Ok(()) => ops.push(format!("remove {:?}", file_name(&backup))),
            Err(e) => ops.push(format!("ERROR removing {:?}: {}", file_name(&backup), e)),
        }
    }

    if let Some(ts) = timestamps {
        if let Err(e) = apply_timestamps(standard, ts) {
            warn!("could not restore timestamps on {}: {}", standard.display(), e);
        }
    }

    info!("replaced {} with {}", original.display(), standard.display());
    Ok(ops)
}
