//! # quarry-common
//!
//! Shared utilities and types for the Quarry image assembler.
//!
//! This crate provides common functionality used across all Quarry crates:
//! - Content digests
//! - The on-disk layout of one assembly run
//! - Common error types and their stable reason codes

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{QuarryError, QuarryResult};
pub use id::Digest;
pub use paths::AssemblyLayout;
