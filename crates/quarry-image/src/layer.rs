//! Layer encoding.
//!
//! A changeset is archived into a private temporary directory inside the
//! layers directory, hashed while it is written, completed with its
//! `VERSION` and `json` records and then published as `<digest>/`.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use quarry_common::paths::{LAYER_ARCHIVE, LAYER_METADATA, LAYER_VERSION};
use quarry_common::{AssemblyLayout, Digest, QuarryError, QuarryResult};
use quarry_oci::image::{CHECKSUM_PREFIX, LAYER_FORMAT_VERSION};
use quarry_oci::{LayerConfig, LayerMetadata, to_canonical_vec};
use tracing::info;

use crate::archive::{DeterministicTar, HashingWriter};
use crate::changeset::Changeset;
use crate::timestamp::BuildTimestamp;

/// A published layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Name of the build dependency the layer was made from.
    pub name: String,
    /// SHA-256 of `layer.tar`.
    pub digest: Digest,
    /// The `<digest>/` directory.
    pub path: PathBuf,
    /// Size of `layer.tar` in bytes.
    pub size: u64,
    /// Number of archive entries.
    pub entries: usize,
}

impl Layer {
    /// Path of the layer archive, relative to the image tree.
    #[must_use]
    pub fn archive_name(&self) -> String {
        format!("{}/{LAYER_ARCHIVE}", self.digest)
    }
}

/// Encodes changesets into published layers.
#[derive(Debug, Clone)]
pub struct LayerEncoder {
    layout: AssemblyLayout,
    timestamp: BuildTimestamp,
    author: String,
    config: LayerConfig,
}

impl LayerEncoder {
    /// Create an encoder publishing into the image tree of `layout`.
    pub fn new(
        layout: AssemblyLayout,
        timestamp: BuildTimestamp,
        author: impl Into<String>,
        config: LayerConfig,
    ) -> Self {
        Self {
            layout,
            timestamp,
            author: author.into(),
            config,
        }
    }

    /// Metadata record for the layer with `digest`.
    #[must_use]
    pub fn metadata(&self, digest: &Digest) -> LayerMetadata {
        LayerMetadata {
            id: digest.to_string(),
            created: self.timestamp.created.clone(),
            author: self.author.clone(),
            checksum: format!("{CHECKSUM_PREFIX}{digest}"),
            config: self.config.clone(),
        }
    }

    /// Encode and publish one changeset.
    ///
    /// # Errors
    ///
    /// Returns an error if the changeset cannot be archived or the layer
    /// cannot be published. Nothing is left at the digest path in that case.
    pub fn encode(&self, changeset: &Changeset) -> QuarryResult<Layer> {
        let started = Instant::now();
        let layers_dir = self.layout.layers();
        fs::create_dir_all(&layers_dir).map_err(|e| QuarryError::io_at(&layers_dir, e))?;

        let staged = tempfile::Builder::new()
            .prefix(".layer-")
            .tempdir_in(&layers_dir)
            .map_err(|e| QuarryError::io_at(&layers_dir, e))?;

        let archive_path = staged.path().join(LAYER_ARCHIVE);
        let file = File::create(&archive_path).map_err(|e| QuarryError::io_at(&archive_path, e))?;

        let mut tar = DeterministicTar::new(
            HashingWriter::new(BufWriter::new(file)),
            self.timestamp.mtime,
        );
        let entries = tar.append_tree(&changeset.root)?;
        let (mut writer, digest, size) = tar.finish()?.finish();
        writer
            .flush()
            .map_err(|e| QuarryError::io_at(&archive_path, e))?;
        let file = writer
            .into_inner()
            .map_err(|e| QuarryError::io_at(&archive_path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| QuarryError::io_at(&archive_path, e))?;

        let version_path = staged.path().join(LAYER_VERSION);
        fs::write(&version_path, LAYER_FORMAT_VERSION)
            .map_err(|e| QuarryError::io_at(&version_path, e))?;

        let metadata_path = staged.path().join(LAYER_METADATA);
        fs::write(&metadata_path, to_canonical_vec(&self.metadata(&digest))?)
            .map_err(|e| QuarryError::io_at(&metadata_path, e))?;

        let path = self.layout.layer(digest.hex());
        let fresh = crate::publish::publish_dir(staged, &path)?;

        info!(
            layer = %changeset.name,
            digest = %digest.short(),
            entries,
            size,
            fresh,
            elapsed_ms = started.elapsed().as_millis(),
            "Encoded layer"
        );

        Ok(Layer {
            name: changeset.name.clone(),
            digest,
            path,
            size,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::TimestampPolicy;
    use tempfile::TempDir;

    fn encoder(run: &std::path::Path) -> LayerEncoder {
        LayerEncoder::new(
            AssemblyLayout::with_root(run),
            TimestampPolicy::Deterministic.resolve().unwrap(),
            "tester",
            LayerConfig {
                cmd: vec!["/bin/app".to_string()],
                ..LayerConfig::default()
            },
        )
    }

    fn changeset(root: &std::path::Path) -> Changeset {
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("bin/app"), "app").unwrap();
        Changeset {
            name: "app".to_string(),
            root: root.to_path_buf(),
            contributors: vec!["app".to_string()],
        }
    }

    #[test]
    fn publishes_digest_directory() {
        let run = TempDir::new().unwrap();
        let layers = run.path().join("layers");
        let layer = encoder(run.path())
            .encode(&changeset(&run.path().join("staging")))
            .unwrap();

        let archive = fs::read(layer.path.join(LAYER_ARCHIVE)).unwrap();
        assert_eq!(Digest::of(&archive), layer.digest);
        assert_eq!(layer.size, archive.len() as u64);
        assert_eq!(layer.entries, 2);
        assert_eq!(layer.path.file_name().unwrap(), layer.digest.hex());
        assert_eq!(
            fs::read_to_string(layer.path.join(LAYER_VERSION)).unwrap(),
            "1.0"
        );
        assert_eq!(layer.archive_name(), format!("{}/layer.tar", layer.digest));

        let metadata: LayerMetadata =
            serde_json::from_slice(&fs::read(layer.path.join(LAYER_METADATA)).unwrap()).unwrap();
        assert_eq!(metadata.id, layer.digest.to_string());
        assert_eq!(metadata.checksum, format!("tarsum.v1+sha256:{}", layer.digest));
        assert_eq!(metadata.created, "2011-11-11T00:00:00Z");
        assert_eq!(metadata.config.cmd, ["/bin/app"]);

        let leftovers: Vec<_> = fs::read_dir(&layers).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn identical_changesets_share_a_layer() {
        let run = TempDir::new().unwrap();
        let layers = run.path().join("layers");
        let encoder = encoder(run.path());

        let first = encoder.encode(&changeset(&run.path().join("one"))).unwrap();
        let second = encoder.encode(&changeset(&run.path().join("two"))).unwrap();

        assert_eq!(first.digest, second.digest);
        assert_eq!(fs::read_dir(&layers).unwrap().count(), 1);
    }

    #[test]
    fn missing_changeset_root_publishes_nothing() {
        let run = TempDir::new().unwrap();
        let layers = run.path().join("layers");
        let missing = Changeset {
            name: "gone".to_string(),
            root: run.path().join("nope"),
            contributors: Vec::new(),
        };

        assert!(encoder(run.path()).encode(&missing).is_err());
        assert_eq!(fs::read_dir(&layers).unwrap().count(), 0);
    }
}
