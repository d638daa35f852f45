//! Image builds driven by an Imagefile.

use std::path::{Path, PathBuf};

use quarry_common::{AssemblyLayout, QuarryResult};
use quarry_image::{AssembledImage, Assembler, AssemblyOptions, ContentStager};

use crate::imagefile::Imagefile;

/// Build options.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Output directory.
    pub output: PathBuf,
    /// Timestamp policy overriding the Imagefile.
    pub timestamp: Option<String>,
    /// Skip `image.tar`.
    pub no_package: bool,
    /// Keep staged changesets.
    pub keep_staging: bool,
}

/// Built image result.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    /// Assembly result.
    pub image: AssembledImage,
    /// `name:tag` pairs.
    pub tags: Vec<String>,
}

impl BuiltImage {
    /// Total size of all layer archives in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.image.layers.iter().map(|layer| layer.size).sum()
    }
}

/// Image builder.
pub struct Builder {
    /// Parsed Imagefile.
    imagefile: Imagefile,
    /// Directory element paths are relative to.
    context: PathBuf,
    /// Build options.
    options: BuildOptions,
}

impl Builder {
    /// Create builder with options.
    pub fn with_options(
        imagefile: Imagefile,
        context: impl Into<PathBuf>,
        options: BuildOptions,
    ) -> Self {
        Self {
            imagefile,
            context: context.into(),
            options,
        }
    }

    /// Load an Imagefile and create a builder for it. Element paths are
    /// resolved against the Imagefile's directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the Imagefile cannot be read or parsed.
    pub fn from_file(path: &Path, options: BuildOptions) -> QuarryResult<Self> {
        let imagefile = Imagefile::from_file(path)?;
        let context = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Ok(Self::with_options(imagefile, context, options))
    }

    /// Build the image.
    ///
    /// Settings are validated before the dependency graph is built and
    /// before anything is written.
    ///
    /// # Errors
    ///
    /// Returns the first validation, graph or assembly error.
    pub fn build(&self) -> QuarryResult<BuiltImage> {
        let mut settings = self.imagefile.image.clone();
        if let Some(timestamp) = &self.options.timestamp {
            settings.timestamp.clone_from(timestamp);
        }
        let definition = settings.validate()?;
        let tags = definition.names.iter().map(ToString::to_string).collect();

        let (graph, image) = self.imagefile.graph(&self.context)?;

        tracing::info!(
            element = %self.imagefile.name,
            nodes = graph.node_count(),
            output = %self.options.output.display(),
            "Building image"
        );

        let assembled = Assembler::new(
            AssemblyLayout::with_root(&self.options.output),
            definition,
            &ContentStager,
        )
        .with_options(AssemblyOptions {
            package: !self.options.no_package,
            keep_staging: self.options.keep_staging,
        })
        .assemble(&graph.node(image))?;

        Ok(BuiltImage {
            image: assembled,
            tags,
        })
    }
}
