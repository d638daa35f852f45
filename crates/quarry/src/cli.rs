//! Quarry CLI.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use quarry_common::QuarryError;
use quarry_image::{VerifiedImage, verify_archive, verify_tree};

use crate::build::{BuildOptions, Builder};

/// Quarry - reproducible Docker image assembler
#[derive(Parser)]
#[command(name = "quarry")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Quarry commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Assemble an image from an Imagefile
    Build {
        /// Path to Imagefile
        #[arg(short, long, default_value = "Imagefile.yaml")]
        file: PathBuf,

        /// Output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Timestamp policy: now, deterministic or YYYY-MM-DDTHH:MM:SSZ
        #[arg(long, env = "QUARRY_TIMESTAMP")]
        timestamp: Option<String>,

        /// Don't package the image tree into image.tar
        #[arg(long)]
        no_package: bool,

        /// Keep staged changesets in <output>/dependencies
        #[arg(long)]
        keep_staging: bool,
    },

    /// Verify a produced image
    Verify {
        /// Build output directory, image tree or image.tar
        path: PathBuf,

        /// Format output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Default log directive for this invocation.
    #[must_use]
    pub const fn log_directive(&self) -> &'static str {
        if self.debug {
            "quarry=debug"
        } else {
            "quarry=info"
        }
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns a report describing the failed command.
    pub fn execute(self) -> Result<()> {
        match self.command {
            Commands::Build {
                file,
                output,
                timestamp,
                no_package,
                keep_staging,
            } => {
                let options = BuildOptions {
                    output,
                    timestamp,
                    no_package,
                    keep_staging,
                };

                let result = Builder::from_file(&file, options)
                    .and_then(|builder| builder.build())
                    .map_err(|err| failure("build", &err))?;

                println!("\nBuild complete!");
                println!("  Image:  {}", result.image.image_id);
                for tag in &result.tags {
                    println!("  Tag:    {tag}");
                }
                println!("  Layers: {}", result.image.layers.len());
                for layer in &result.image.layers {
                    println!("    {} {} ({} bytes)", layer.digest.short(), layer.name, layer.size);
                }
                println!("  Size:   {} bytes", result.size());
                println!("  Tree:   {}", result.image.tree.display());
                if let Some(archive) = &result.image.archive {
                    println!("  Archive: {}", archive.display());
                }

                Ok(())
            }

            Commands::Verify { path, json } => {
                tracing::info!(path = %path.display(), "Verifying image");

                let verified = verify_path(&path).map_err(|err| failure("verify", &err))?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&verified)?);
                } else {
                    println!("Image: {}", verified.image_id);
                    println!("Created: {}", verified.created);
                    println!("Layers: {}", verified.layers.len());
                    for layer in &verified.layers {
                        println!("  {layer}");
                    }
                    for tag in &verified.repo_tags {
                        println!("Tag: {tag}");
                    }
                    println!("OK");
                }

                Ok(())
            }
        }
    }
}

/// Report a failed command as `<command> failed [<reason>]: <message>`.
fn failure(command: &str, err: &QuarryError) -> color_eyre::Report {
    eyre!("{command} failed [{}]: {err}", err.reason())
}

/// Verify an `image.tar`, an image tree, or a build output directory.
fn verify_path(path: &Path) -> quarry_common::QuarryResult<VerifiedImage> {
    if path.is_file() {
        return verify_archive(path);
    }

    let layout = quarry_common::AssemblyLayout::with_root(path);
    if layout.manifest().is_file() {
        verify_tree(&layout.layers())
    } else {
        verify_tree(path)
    }
}
