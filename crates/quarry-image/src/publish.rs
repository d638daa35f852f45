//! Atomic publication of files and directories.
//!
//! Everything that lands at a final path in the image tree is first fully
//! written into a temporary sibling and then moved into place with a
//! single rename. Staged trees may carry read-only directories, so they
//! are opened up before they are modified or removed.

use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use quarry_common::{QuarryError, QuarryResult};
use tempfile::{NamedTempFile, TempDir};
use tracing::debug;

const PUBLISHED_FILE_MODE: u32 = 0o644;
const PUBLISHED_DIR_MODE: u32 = 0o755;
const OWNER_RWX: u32 = 0o700;
const PERMISSION_BITS: u32 = 0o7777;

fn parent_of(path: &Path) -> QuarryResult<&Path> {
    path.parent().ok_or_else(|| QuarryError::Internal {
        message: format!("{} has no parent directory", path.display()),
    })
}

/// Create a temporary file next to `path`.
///
/// # Errors
///
/// Returns an error if the parent directory cannot be created or written.
pub fn temp_file_for(path: &Path) -> QuarryResult<NamedTempFile> {
    let dir = parent_of(path)?;
    fs::create_dir_all(dir).map_err(|e| QuarryError::io_at(dir, e))?;
    tempfile::Builder::new()
        .prefix(".quarry-")
        .tempfile_in(dir)
        .map_err(|e| QuarryError::io_at(dir, e))
}

/// Sync `file` and rename it to `path`.
///
/// # Errors
///
/// Returns an error if syncing or renaming fails.
pub fn persist_file(file: NamedTempFile, path: &Path) -> QuarryResult<()> {
    let handle = file.as_file();
    handle
        .set_permissions(Permissions::from_mode(PUBLISHED_FILE_MODE))
        .and_then(|()| handle.sync_all())
        .map_err(|e| QuarryError::io_at(file.path(), e))?;
    file.persist(path)
        .map_err(|e| QuarryError::io_at(path, e.error))?;
    Ok(())
}

/// Write `bytes` to `path` through a temporary file and a rename.
///
/// # Errors
///
/// Returns an error if any step fails; `path` is then left untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> QuarryResult<()> {
    let mut file = temp_file_for(path)?;
    file.write_all(bytes)
        .map_err(|e| QuarryError::io_at(file.path(), e))?;
    persist_file(file, path)
}

/// Move a fully written temporary directory to `dest`.
///
/// Content-addressed destinations are write-once: if `dest` already exists,
/// or appears while publishing, the staged copy is discarded and `false`
/// is returned.
///
/// # Errors
///
/// Returns an error if the rename fails for another reason.
pub fn publish_dir(staged: TempDir, dest: &Path) -> QuarryResult<bool> {
    if dest.is_dir() {
        debug!(dest = %dest.display(), "Already published, discarding staged copy");
        return Ok(false);
    }

    fs::set_permissions(staged.path(), Permissions::from_mode(PUBLISHED_DIR_MODE))
        .map_err(|e| QuarryError::io_at(staged.path(), e))?;

    match fs::rename(staged.path(), dest) {
        Ok(()) => {
            debug!(from = %staged.path().display(), dest = %dest.display(), "Published");
            // The guard now points at a vacated path; dropping it is a no-op.
            drop(staged);
            Ok(true)
        }
        Err(_) if dest.is_dir() => {
            debug!(dest = %dest.display(), "Published concurrently, discarding staged copy");
            Ok(false)
        }
        Err(e) => Err(QuarryError::io_at(dest, e)),
    }
}

/// Give the owner full access to every directory below `root`, `root`
/// included, and return the directories changed with their previous
/// permissions, parents before children.
///
/// A missing `root` or a `root` that is not a directory changes nothing.
///
/// # Errors
///
/// Returns an error if a directory cannot be listed or changed.
pub fn unlock_tree(root: &Path) -> io::Result<Vec<(PathBuf, Permissions)>> {
    let mut unlocked = Vec::new();
    let mut pending = match fs::symlink_metadata(root) {
        Ok(meta) if meta.is_dir() => vec![root.to_path_buf()],
        Ok(_) => return Ok(unlocked),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(unlocked),
        Err(e) => return Err(e),
    };

    // Widen before listing so directories without read or search
    // permission can still be descended into.
    while let Some(dir) = pending.pop() {
        let mode = fs::symlink_metadata(&dir)?.permissions().mode() & PERMISSION_BITS;
        if mode & OWNER_RWX != OWNER_RWX {
            fs::set_permissions(&dir, Permissions::from_mode(mode | OWNER_RWX))?;
            unlocked.push((dir.clone(), Permissions::from_mode(mode)));
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                pending.push(entry.path());
            }
        }
    }
    Ok(unlocked)
}

/// Remove `path` and everything below it, read-only directories included.
///
/// # Errors
///
/// Returns an error if the tree cannot be opened up or removed.
pub fn remove_tree(path: &Path) -> QuarryResult<()> {
    if fs::symlink_metadata(path).is_err() {
        return Ok(());
    }
    debug!(path = %path.display(), "Removing directory");
    unlock_tree(path).map_err(|e| QuarryError::io_at(path, e))?;
    fs::remove_dir_all(path).map_err(|e| QuarryError::io_at(path, e))
}
