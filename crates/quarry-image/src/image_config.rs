//! Image configuration document.

use quarry_common::paths::AssemblyLayout;
use quarry_common::{Digest, QuarryResult};
use quarry_oci::image::ROOTFS_TYPE;
use quarry_oci::{ContainerConfig, HistoryEntry, ImageConfig, RootFs, to_canonical_vec};
use tracing::info;

use crate::layer::Layer;
use crate::publish::write_atomic;
use crate::settings::ImageDefinition;
use crate::timestamp::BuildTimestamp;

/// `created_by` of every history entry.
pub const HISTORY_CREATED_BY: &str = "quarry image assembler";

/// Builds `<image_id>.json`.
#[derive(Debug, Clone)]
pub struct ImageConfigBuilder {
    created: String,
    author: String,
    architecture: String,
    os: String,
    config: ContainerConfig,
}

impl ImageConfigBuilder {
    /// Create a builder for `definition`, stamped with `timestamp`.
    #[must_use]
    pub fn new(definition: &ImageDefinition, timestamp: &BuildTimestamp) -> Self {
        Self {
            created: timestamp.created.clone(),
            author: definition.author.clone(),
            architecture: definition.architecture.clone(),
            os: definition.os.clone(),
            config: definition.config.clone(),
        }
    }

    /// The configuration for `layers`, bottom to top.
    #[must_use]
    pub fn build(&self, layers: &[Layer]) -> ImageConfig {
        ImageConfig {
            created: self.created.clone(),
            author: self.author.clone(),
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            config: self.config.clone(),
            rootfs: RootFs {
                fs_type: ROOTFS_TYPE.to_string(),
                diff_ids: layers.iter().map(|layer| layer.digest.prefixed()).collect(),
            },
            history: layers
                .iter()
                .map(|_| HistoryEntry {
                    created: self.created.clone(),
                    created_by: HISTORY_CREATED_BY.to_string(),
                })
                .collect(),
        }
    }

    /// Serialize the configuration for `layers` and write it under its
    /// own digest. Returns the image ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be serialized or written.
    pub fn write(&self, layout: &AssemblyLayout, layers: &[Layer]) -> QuarryResult<Digest> {
        let bytes = to_canonical_vec(&self.build(layers))?;
        let image_id = Digest::of(&bytes);
        let path = layout.image_config(image_id.hex());
        write_atomic(&path, &bytes)?;

        info!(image_id = %image_id.short(), layers = layers.len(), "Wrote image config");
        Ok(image_id)
    }
}
