//! Deterministic tar archives.
//!
//! Entries are emitted in a fixed order (depth-first, siblings sorted by
//! file name) with normalized ownership and timestamps, so the same tree
//! always produces the same bytes.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use quarry_common::{Digest, QuarryError, QuarryResult};
use sha2::{Digest as _, Sha256};
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

/// Kind of an archivable entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Directory.
    Directory,
    /// Regular file.
    File {
        /// Size in bytes.
        size: u64,
    },
    /// Symbolic link.
    Symlink {
        /// Link target, stored verbatim.
        target: PathBuf,
    },
}

/// One entry of a tree, in archive order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Path relative to the tree root; the name inside the archive.
    pub relative: PathBuf,
    /// Path on disk.
    pub path: PathBuf,
    /// Entry kind.
    pub kind: EntryKind,
    /// Permission bits.
    pub mode: u32,
}

impl TreeEntry {
    /// Whether this entry is a directory.
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }
}

/// Walk `root` top-down, siblings sorted by file name.
///
/// The root itself is not included. Sockets, fifos and devices are skipped
/// with a warning.
///
/// # Errors
///
/// Returns an error if the tree cannot be read.
pub fn walk_tree(root: &Path) -> QuarryResult<Vec<TreeEntry>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| QuarryError::io_at(root, e.into()))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|_| QuarryError::Internal {
                message: format!("{} escaped {}", path.display(), root.display()),
            })?
            .to_path_buf();
        let metadata = entry
            .metadata()
            .map_err(|e| QuarryError::io_at(path, e.into()))?;
        let file_type = metadata.file_type();

        let kind = if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File {
                size: metadata.len(),
            }
        } else if file_type.is_symlink() {
            EntryKind::Symlink {
                target: std::fs::read_link(path).map_err(|e| QuarryError::io_at(path, e))?,
            }
        } else {
            tracing::warn!(path = %path.display(), "Skipping special file");
            continue;
        };

        entries.push(TreeEntry {
            relative,
            path: path.to_path_buf(),
            kind,
            mode: metadata.permissions().mode() & 0o7777,
        });
    }

    Ok(entries)
}

/// A writer that hashes everything written through it.
#[derive(Debug)]
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wrap `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Return the inner writer, the digest and the byte count.
    pub fn finish(self) -> (W, Digest, u64) {
        (self.inner, Digest::from_hasher(self.hasher), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Tar builder with normalized headers.
///
/// Every entry gets the given mtime, uid/gid 0 and empty user/group
/// names. Permission bits are taken from the [`TreeEntry`].
pub struct DeterministicTar<W: Write> {
    builder: Builder<W>,
    mtime: u64,
}

impl<W: Write> DeterministicTar<W> {
    /// Start an archive written to `writer`.
    pub fn new(writer: W, mtime: u64) -> Self {
        let mut builder = Builder::new(writer);
        builder.follow_symlinks(false);
        Self { builder, mtime }
    }

    fn header(&self, entry_type: EntryType, mode: u32, size: u64) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(mode);
        header.set_size(size);
        header.set_mtime(self.mtime);
        header.set_uid(0);
        header.set_gid(0);
        header
    }

    /// Append one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be read or written.
    pub fn append_entry(&mut self, entry: &TreeEntry) -> QuarryResult<()> {
        let at = |e: io::Error| QuarryError::io_at(&entry.path, e);

        match &entry.kind {
            EntryKind::Directory => {
                let mut header = self.header(EntryType::Directory, entry.mode, 0);
                self.builder
                    .append_data(&mut header, &entry.relative, io::empty())
                    .map_err(at)?;
            }
            EntryKind::File { size } => {
                let mut header = self.header(EntryType::Regular, entry.mode, *size);
                let file = File::open(&entry.path).map_err(at)?;
                self.builder
                    .append_data(&mut header, &entry.relative, file)
                    .map_err(at)?;
            }
            EntryKind::Symlink { target } => {
                let mut header = self.header(EntryType::Symlink, entry.mode, 0);
                self.builder
                    .append_link(&mut header, &entry.relative, target)
                    .map_err(at)?;
            }
        }

        Ok(())
    }

    /// Append every entry of `root` in archive order.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be walked or written.
    pub fn append_tree(&mut self, root: &Path) -> QuarryResult<usize> {
        let entries = walk_tree(root)?;
        for entry in &entries {
            self.append_entry(entry)?;
        }
        Ok(entries.len())
    }

    /// Write the end-of-archive marker and return the writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the trailer cannot be written.
    pub fn finish(self) -> QuarryResult<W> {
        Ok(self.builder.into_inner()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("usr/lib")).unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("usr/lib/libfoo.so"), b"\x7fELF").unwrap();
        fs::write(dir.path().join("bin/app"), b"app").unwrap();
        fs::write(dir.path().join("a.txt"), b"first").unwrap();
        symlink("../usr/lib/libfoo.so", dir.path().join("bin/libfoo")).unwrap();
        dir
    }

    fn archive(root: &Path, mtime: u64) -> (Vec<u8>, Digest) {
        let mut tar = DeterministicTar::new(HashingWriter::new(Vec::new()), mtime);
        tar.append_tree(root).unwrap();
        let (bytes, digest, size) = tar.finish().unwrap().finish();
        assert_eq!(size, bytes.len() as u64);
        (bytes, digest)
    }

    #[test]
    fn walk_order_is_sorted_depth_first() {
        let dir = sample_tree();
        let entries = walk_tree(dir.path()).unwrap();
        let paths: Vec<_> = entries
            .iter()
            .map(|e| e.relative.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            paths,
            [
                "a.txt",
                "bin",
                "bin/app",
                "bin/libfoo",
                "usr",
                "usr/lib",
                "usr/lib/libfoo.so"
            ]
        );
        assert!(entries[1].is_dir());
        assert_eq!(
            entries[3].kind,
            EntryKind::Symlink {
                target: "../usr/lib/libfoo.so".into()
            }
        );
    }

    #[test]
    fn headers_are_normalized() {
        let dir = sample_tree();
        let (bytes, _) = archive(dir.path(), 1_320_969_600);

        let mut reader = tar::Archive::new(bytes.as_slice());
        for entry in reader.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.mtime().unwrap(), 1_320_969_600);
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
            assert!(entry.path().unwrap().is_relative());
        }
    }

    #[test]
    fn digest_matches_bytes_and_is_reproducible() {
        let first = sample_tree();
        let second = sample_tree();

        let (bytes, digest) = archive(first.path(), 0);
        let (again, digest_again) = archive(second.path(), 0);
        assert_eq!(digest, Digest::of(&bytes));
        assert_eq!(bytes, again);
        assert_eq!(digest, digest_again);

        let (_, later) = archive(first.path(), 1);
        assert_ne!(digest, later);
    }

    #[test]
    fn empty_tree_is_a_valid_archive() {
        let dir = TempDir::new().unwrap();
        let (bytes, _) = archive(dir.path(), 0);
        assert_eq!(bytes.len(), 1024);
        let mut reader = tar::Archive::new(bytes.as_slice());
        assert_eq!(reader.entries().unwrap().count(), 0);
    }
}
