//! Verification of produced images.
//!
//! Re-derives every digest of an image tree from the bytes on disk and
//! checks that the documents agree with each other.

use std::fs::{self, File};
use std::path::Path;

use quarry_common::paths::{
    LAYER_ARCHIVE, LAYER_METADATA, LAYER_VERSION, MANIFEST_FILE, REPOSITORIES_FILE,
};
use quarry_common::{Digest, QuarryError, QuarryResult};
use quarry_oci::image::{CHECKSUM_PREFIX, LAYER_FORMAT_VERSION};
use quarry_oci::{ImageConfig, LayerMetadata, ManifestEntry, Repositories};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Summary of a verified image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedImage {
    /// Image ID.
    pub image_id: Digest,
    /// Layer digests, bottom to top.
    pub layers: Vec<Digest>,
    /// `name:tag` pairs.
    pub repo_tags: Vec<String>,
    /// Creation timestamp.
    pub created: String,
}

fn fail(message: impl Into<String>) -> QuarryError {
    QuarryError::Verification {
        message: message.into(),
    }
}

fn read(path: &Path) -> QuarryResult<Vec<u8>> {
    fs::read(path).map_err(|e| QuarryError::io_at(path, e))
}

fn parse<T: DeserializeOwned>(path: &Path) -> QuarryResult<T> {
    serde_json::from_slice(&read(path)?)
        .map_err(|e| fail(format!("{} is malformed: {e}", path.display())))
}

/// Verify an unpacked image tree.
///
/// # Errors
///
/// Returns [`QuarryError::Verification`] for the first violated invariant,
/// or an I/O error if a referenced file is missing.
pub fn verify_tree(tree: &Path) -> QuarryResult<VerifiedImage> {
    let manifest: Vec<ManifestEntry> = parse(&tree.join(MANIFEST_FILE))?;
    let [entry] = manifest.as_slice() else {
        return Err(fail(format!(
            "expected exactly one manifest entry, found {}",
            manifest.len()
        )));
    };

    let stem = entry
        .config
        .strip_suffix(".json")
        .ok_or_else(|| fail(format!("config '{}' is not a .json file", entry.config)))?;
    let image_id = Digest::from_hex(stem)?;
    let config_bytes = read(&tree.join(&entry.config))?;
    if Digest::of(&config_bytes) != image_id {
        return Err(fail(format!("image config does not hash to {image_id}")));
    }
    let config: ImageConfig = serde_json::from_slice(&config_bytes)
        .map_err(|e| fail(format!("image config is malformed: {e}")))?;

    if config.rootfs.diff_ids.len() != entry.layers.len() {
        return Err(fail(format!(
            "config lists {} layers, manifest lists {}",
            config.rootfs.diff_ids.len(),
            entry.layers.len()
        )));
    }
    if config.history.len() != entry.layers.len() {
        return Err(fail(format!(
            "history has {} entries for {} layers",
            config.history.len(),
            entry.layers.len()
        )));
    }

    let mut layers = Vec::with_capacity(entry.layers.len());
    for (archive, diff_id) in entry.layers.iter().zip(&config.rootfs.diff_ids) {
        let digest = verify_layer(tree, archive)?;
        if *diff_id != digest.prefixed() {
            return Err(fail(format!(
                "diff_id {diff_id} does not match layer {archive}"
            )));
        }
        layers.push(digest);
    }

    let top = layers
        .last()
        .ok_or_else(|| fail("image has no layers"))?;
    let repositories: Repositories = parse(&tree.join(REPOSITORIES_FILE))?;
    for (name, value) in repositories.iter() {
        let (tag, digest) = Repositories::split_value(value)
            .ok_or_else(|| fail(format!("repository '{name}' has no tag")))?;
        if digest != top.hex() {
            return Err(fail(format!("repository '{name}' does not point at the top layer")));
        }
        let tagged = format!("{name}:{tag}");
        if !entry.repo_tags.contains(&tagged) {
            return Err(fail(format!("{tagged} is missing from RepoTags")));
        }
    }

    debug!(image_id = %image_id.short(), layers = layers.len(), "Verified image tree");
    Ok(VerifiedImage {
        image_id,
        layers,
        repo_tags: entry.repo_tags.clone(),
        created: config.created,
    })
}

fn verify_layer(tree: &Path, archive: &str) -> QuarryResult<Digest> {
    let dir_name = archive
        .strip_suffix(&format!("/{LAYER_ARCHIVE}"))
        .ok_or_else(|| fail(format!("layer '{archive}' is not <digest>/{LAYER_ARCHIVE}")))?;
    let digest = Digest::from_hex(dir_name)?;
    let dir = tree.join(dir_name);

    let archive_path = dir.join(LAYER_ARCHIVE);
    let file = File::open(&archive_path).map_err(|e| QuarryError::io_at(&archive_path, e))?;
    if Digest::of_reader(file)? != digest {
        return Err(fail(format!("{archive} does not hash to its directory name")));
    }

    let version = read(&dir.join(LAYER_VERSION))?;
    if version != LAYER_FORMAT_VERSION.as_bytes() {
        return Err(fail(format!("{dir_name}/{LAYER_VERSION} is not {LAYER_FORMAT_VERSION}")));
    }

    let metadata: LayerMetadata = parse(&dir.join(LAYER_METADATA))?;
    if metadata.id != digest.hex() || metadata.checksum != format!("{CHECKSUM_PREFIX}{digest}") {
        return Err(fail(format!("{dir_name}/{LAYER_METADATA} does not describe this layer")));
    }

    Ok(digest)
}

/// Unpack a packaged image into a scratch directory and verify it.
///
/// # Errors
///
/// Returns an error if the archive cannot be unpacked or the tree fails
/// [`verify_tree`].
pub fn verify_archive(archive: &Path) -> QuarryResult<VerifiedImage> {
    let scratch = tempfile::tempdir()?;
    let file = File::open(archive).map_err(|e| QuarryError::io_at(archive, e))?;
    tar::Archive::new(file)
        .unpack(scratch.path())
        .map_err(|e| QuarryError::io_at(archive, e))?;
    verify_tree(scratch.path())
}
