//! Packaging of the image tree into `image.tar`.

use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use quarry_common::{Digest, QuarryError, QuarryResult};
use tracing::info;

use crate::archive::{DeterministicTar, HashingWriter, TreeEntry, walk_tree};
use crate::publish::{persist_file, temp_file_for};

/// Packs an image tree into a single uncompressed archive.
///
/// Entries are sorted like layer archives and carry the same mtime. Modes
/// are normalized to 0755 for directories and 0644 for files so the result
/// does not depend on the umask of the build host.
#[derive(Debug, Clone, Copy)]
pub struct Packager {
    mtime: u64,
}

/// Result of packaging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedImage {
    /// SHA-256 of the archive.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// Number of entries.
    pub entries: usize,
}

impl Packager {
    const DIR_MODE: u32 = 0o755;
    const FILE_MODE: u32 = 0o644;

    /// Create a packager stamping entries with `mtime`.
    #[must_use]
    pub const fn new(mtime: u64) -> Self {
        Self { mtime }
    }

    /// Archive everything below `tree` into `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be read or the archive written.
    pub fn pack(&self, tree: &Path, dest: &Path) -> QuarryResult<PackagedImage> {
        let started = Instant::now();
        let mut file = temp_file_for(dest)?;

        let writer = HashingWriter::new(BufWriter::new(file.as_file_mut()));
        let mut tar = DeterministicTar::new(writer, self.mtime);
        let mut entries = 0;
        for entry in walk_tree(tree)? {
            tar.append_entry(&Self::normalize(entry))?;
            entries += 1;
        }
        let (mut writer, digest, size) = tar.finish()?.finish();
        writer.flush().map_err(|e| QuarryError::io_at(dest, e))?;
        drop(writer);

        persist_file(file, dest)?;

        info!(
            archive = %dest.display(),
            digest = %digest.short(),
            entries,
            size,
            elapsed_ms = started.elapsed().as_millis(),
            "Packaged image"
        );
        Ok(PackagedImage {
            digest,
            size,
            entries,
        })
    }

    fn normalize(entry: TreeEntry) -> TreeEntry {
        let mode = if entry.is_dir() {
            Self::DIR_MODE
        } else {
            Self::FILE_MODE
        };
        TreeEntry { mode, ..entry }
    }
}
