//! # quarry-oci
//!
//! Document types of the Docker image archive layout consumed by
//! `docker load`:
//! - Image configuration (`<image_id>.json`)
//! - Per-layer metadata (`<digest>/json`)
//! - `manifest.json` and `repositories`
//!
//! All documents are written through [`canonical`] so their bytes, and
//! therefore their digests, are stable.

#![warn(missing_docs)]

pub mod canonical;
pub mod image;

pub use canonical::to_canonical_vec;
pub use image::{
    ContainerConfig, Healthcheck, HistoryEntry, ImageConfig, LayerConfig, LayerMetadata,
    ManifestEntry, Repositories, RootFs,
};
