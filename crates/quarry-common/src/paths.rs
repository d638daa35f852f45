//! Filesystem layout of one assembly run.

use std::path::{Path, PathBuf};

/// Name of the packaged image archive.
pub const IMAGE_ARCHIVE: &str = "image.tar";
/// Name of the manifest document in the image tree.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Name of the repository index in the image tree.
pub const REPOSITORIES_FILE: &str = "repositories";
/// Name of a layer's archive inside its digest directory.
pub const LAYER_ARCHIVE: &str = "layer.tar";
/// Name of a layer's metadata record inside its digest directory.
pub const LAYER_METADATA: &str = "json";
/// Name of a layer's version marker inside its digest directory.
pub const LAYER_VERSION: &str = "VERSION";

/// Directory layout used by one assembly run.
///
/// ```text
/// <root>/
/// ├── dependencies/<changeset>/   staged changesets
/// ├── layers/                     the image tree
/// │   ├── <digest>/{VERSION,json,layer.tar}
/// │   ├── <image_id>.json
/// │   ├── manifest.json
/// │   └── repositories
/// └── image/image.tar             packaged image
/// ```
#[derive(Debug, Clone)]
pub struct AssemblyLayout {
    /// Root of the run.
    pub root: PathBuf,
}

impl AssemblyLayout {
    /// Create a layout rooted at `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding all staged changesets.
    #[must_use]
    pub fn dependencies(&self) -> PathBuf {
        self.root.join("dependencies")
    }

    /// Staging directory for one changeset.
    #[must_use]
    pub fn dependency(&self, dir_name: &str) -> PathBuf {
        self.dependencies().join(dir_name)
    }

    /// The image tree (`docker load` layout, unpacked).
    #[must_use]
    pub fn layers(&self) -> PathBuf {
        self.root.join("layers")
    }

    /// Directory of a published layer.
    #[must_use]
    pub fn layer(&self, digest: &str) -> PathBuf {
        self.layers().join(digest)
    }

    /// Path of the image configuration document.
    #[must_use]
    pub fn image_config(&self, image_id: &str) -> PathBuf {
        self.layers().join(format!("{image_id}.json"))
    }

    /// Path of `manifest.json`.
    #[must_use]
    pub fn manifest(&self) -> PathBuf {
        self.layers().join(MANIFEST_FILE)
    }

    /// Path of `repositories`.
    #[must_use]
    pub fn repositories(&self) -> PathBuf {
        self.layers().join(REPOSITORIES_FILE)
    }

    /// Directory receiving the packaged image.
    #[must_use]
    pub fn image(&self) -> PathBuf {
        self.root.join("image")
    }

    /// Path of the packaged image archive.
    #[must_use]
    pub fn image_archive(&self) -> PathBuf {
        self.image().join(IMAGE_ARCHIVE)
    }

    /// Root of the run.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Turn an arbitrary element name into a single safe path component.
///
/// Characters outside `[A-Za-z0-9._-]` become `-`, so `base/alpine.bst`
/// becomes `base-alpine.bst`.
#[must_use]
pub fn normal_name(name: &str) -> String {
    let normal: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();

    if matches!(normal.as_str(), "" | "." | "..") {
        format!("_{normal}")
    } else {
        normal
    }
}
