//! # quarry
//!
//! Command-line front end of the Quarry image assembler.
//!
//! Quarry turns a dependency graph of pre-built filesystem trees into a
//! Docker image loadable with `docker load`:
//! - YAML/TOML/JSON-based Imagefile describing the graph and image settings
//! - One layer per build dependency, runtime closures included
//! - Byte-reproducible output with the `deterministic` timestamp policy
//! - Verification of produced images

#![warn(missing_docs)]

pub mod build;
pub mod cli;
pub mod imagefile;

pub use build::{BuildOptions, Builder, BuiltImage};
pub use imagefile::{ElementSpec, Imagefile};
