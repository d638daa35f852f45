//! # quarry-image
//!
//! Reproducible assembly of Docker images from a dependency graph.
//!
//! This crate provides:
//! - Changeset collection over build and runtime dependencies
//! - Deterministic layer encoding and atomic publication
//! - Image config, manifest and repository documents
//! - Packaging into a single `image.tar` and verification of the result

#![warn(missing_docs)]

pub mod archive;
pub mod assemble;
pub mod changeset;
pub mod graph;
pub mod image_config;
pub mod layer;
pub mod manifest;
pub mod package;
pub mod publish;
pub mod reference;
pub mod settings;
pub mod timestamp;
pub mod verify;

pub use assemble::{AssembledImage, Assembler, AssemblyOptions};
pub use changeset::{Changeset, ChangesetCollector, ClaimSet};
pub use graph::{ContentStager, DependencyNode, InMemoryGraph, NodeContents, Stager};
pub use layer::{Layer, LayerEncoder};
pub use reference::ImageName;
pub use settings::{ImageDefinition, ImageSettings};
pub use timestamp::{BuildTimestamp, TimestampPolicy};
pub use verify::{VerifiedImage, verify_archive, verify_tree};
