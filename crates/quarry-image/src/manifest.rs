//! `manifest.json` and `repositories`.

use quarry_common::paths::AssemblyLayout;
use quarry_common::{Digest, QuarryError, QuarryResult};
use quarry_oci::{ManifestEntry, Repositories, to_canonical_vec};
use tracing::info;

use crate::layer::Layer;
use crate::publish::write_atomic;
use crate::reference::ImageName;

/// The single-entry manifest for an image.
#[must_use]
pub fn manifest(image_id: &Digest, layers: &[Layer], names: &[ImageName]) -> Vec<ManifestEntry> {
    vec![ManifestEntry {
        config: format!("{image_id}.json"),
        layers: layers.iter().map(Layer::archive_name).collect(),
        repo_tags: names.iter().map(ToString::to_string).collect(),
    }]
}

/// The repository index: every name maps to `<tag>:<top layer digest>`.
///
/// When a name is declared with several tags, the last one wins.
///
/// # Errors
///
/// Returns an error if there are no layers.
pub fn repositories(layers: &[Layer], names: &[ImageName]) -> QuarryResult<Repositories> {
    let top = layers.last().ok_or_else(|| QuarryError::Internal {
        message: "repository index requested for an image without layers".to_string(),
    })?;

    let mut index = Repositories::default();
    for name in names {
        index
            .0
            .insert(name.name.clone(), format!("{}:{}", name.tag, top.digest));
    }
    Ok(index)
}

/// Write both documents into the image tree.
///
/// # Errors
///
/// Returns an error if either document cannot be serialized or written.
pub fn write_manifests(
    layout: &AssemblyLayout,
    image_id: &Digest,
    layers: &[Layer],
    names: &[ImageName],
) -> QuarryResult<()> {
    let entries = manifest(image_id, layers, names);
    let index = repositories(layers, names)?;

    write_atomic(&layout.manifest(), &to_canonical_vec(&entries)?)?;
    write_atomic(&layout.repositories(), &to_canonical_vec(&index)?)?;

    info!(
        tags = names.len(),
        repositories = index.0.len(),
        "Wrote manifest and repositories"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(data: &[u8]) -> Layer {
        let digest = Digest::of(data);
        Layer {
            name: "dep".to_string(),
            path: digest.hex().into(),
            digest,
            size: 0,
            entries: 0,
        }
    }

    fn names(names: &[&str]) -> Vec<ImageName> {
        names.iter().map(|n| ImageName::parse(n).unwrap()).collect()
    }

    #[test]
    fn manifest_lists_layers_bottom_to_top() {
        let image_id = Digest::of(b"config");
        let layers = [layer(b"bottom"), layer(b"top")];
        let entries = manifest(&image_id, &layers, &names(&["app", "web:1.0"]));

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].config, format!("{image_id}.json"));
        assert_eq!(
            entries[0].layers,
            [
                format!("{}/layer.tar", layers[0].digest),
                format!("{}/layer.tar", layers[1].digest)
            ]
        );
        assert_eq!(entries[0].repo_tags, ["app:latest", "web:1.0"]);
    }

    #[test]
    fn repositories_point_at_top_layer() {
        let layers = [layer(b"bottom"), layer(b"top")];
        let index = repositories(&layers, &names(&["app:1", "web", "app:2"])).unwrap();

        let top = layers[1].digest.to_string();
        assert_eq!(index.0.len(), 2);
        assert_eq!(index.0["app"], format!("2:{top}"));
        assert_eq!(index.0["web"], format!("latest:{top}"));
    }

    #[test]
    fn repositories_need_a_layer() {
        assert!(repositories(&[], &names(&["app"])).is_err());
    }
}
