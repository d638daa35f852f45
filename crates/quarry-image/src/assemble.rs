//! End-to-end image assembly.

use std::path::PathBuf;
use std::time::Instant;

use quarry_common::{AssemblyLayout, Digest, QuarryError, QuarryResult};
use tracing::{info, warn};

use crate::changeset::{ChangesetCollector, ClaimSet};
use crate::graph::{DependencyNode, Stager};
use crate::image_config::ImageConfigBuilder;
use crate::layer::{Layer, LayerEncoder};
use crate::manifest::write_manifests;
use crate::package::Packager;
use crate::publish::remove_tree;
use crate::settings::ImageDefinition;
use crate::timestamp::BuildTimestamp;

/// Assembly options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyOptions {
    /// Produce `image/image.tar`.
    pub package: bool,
    /// Keep `dependencies/` after the run.
    pub keep_staging: bool,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            package: true,
            keep_staging: false,
        }
    }
}

/// Result of a successful assembly.
#[derive(Debug, Clone)]
pub struct AssembledImage {
    /// Image ID.
    pub image_id: Digest,
    /// Layers, bottom to top.
    pub layers: Vec<Layer>,
    /// The image tree.
    pub tree: PathBuf,
    /// The packaged archive, if requested.
    pub archive: Option<PathBuf>,
    /// Creation timestamp shared by every document.
    pub created: String,
}

/// Assembles an image from the build dependencies of an image element.
pub struct Assembler<'s, S> {
    layout: AssemblyLayout,
    definition: ImageDefinition,
    stager: &'s S,
    options: AssemblyOptions,
}

impl<'s, S> Assembler<'s, S> {
    /// Create an assembler writing below `layout`.
    pub fn new(layout: AssemblyLayout, definition: ImageDefinition, stager: &'s S) -> Self {
        Self {
            layout,
            definition,
            stager,
            options: AssemblyOptions::default(),
        }
    }

    /// Set assembly options.
    #[must_use]
    pub const fn with_options(mut self, options: AssemblyOptions) -> Self {
        self.options = options;
        self
    }

    /// The output layout.
    #[must_use]
    pub const fn layout(&self) -> &AssemblyLayout {
        &self.layout
    }

    /// Assemble the image for `image`.
    ///
    /// The image element must have at least one build dependency and no
    /// runtime dependencies. Each build dependency becomes one layer, in
    /// declaration order.
    ///
    /// # Errors
    ///
    /// Returns the first error of any stage. Staging is removed on failure
    /// too, unless it is kept by the options. Failing to remove staging
    /// fails an otherwise successful run.
    pub fn assemble<N>(&self, image: &N) -> QuarryResult<AssembledImage>
    where
        N: DependencyNode,
        S: Stager<N>,
    {
        let build_deps = check_shape(image)?;
        let timestamp = self.definition.timestamp.resolve()?;

        info!(
            element = image.name(),
            output = %self.layout.root().display(),
            build_dependencies = build_deps.len(),
            created = %timestamp.created,
            "Assembling image"
        );

        let assembled = self.run(&build_deps, &timestamp);
        if self.options.keep_staging {
            return assembled;
        }

        match (assembled, remove_tree(&self.layout.dependencies())) {
            (Ok(image), Ok(())) => Ok(image),
            (Ok(_), Err(cleanup)) => Err(cleanup),
            (Err(err), cleanup) => {
                if let Err(cleanup) = cleanup {
                    warn!(error = %cleanup, "Failed to remove staging directory");
                }
                Err(err)
            }
        }
    }

    fn run<N>(&self, build_deps: &[N], timestamp: &BuildTimestamp) -> QuarryResult<AssembledImage>
    where
        N: DependencyNode,
        S: Stager<N>,
    {
        let started = Instant::now();
        remove_tree(&self.layout.dependencies())?;
        remove_tree(&self.layout.layers())?;

        let mut claims = ClaimSet::new();
        let changesets =
            ChangesetCollector::new(&self.layout, self.stager).collect(build_deps, &mut claims)?;

        let encoder = LayerEncoder::new(
            self.layout.clone(),
            timestamp.clone(),
            self.definition.author.clone(),
            self.definition.layer_config(),
        );
        let layers = changesets
            .iter()
            .map(|changeset| encoder.encode(changeset))
            .collect::<QuarryResult<Vec<_>>>()?;

        let image_id =
            ImageConfigBuilder::new(&self.definition, timestamp).write(&self.layout, &layers)?;
        write_manifests(&self.layout, &image_id, &layers, &self.definition.names)?;

        let archive = if self.options.package {
            let dest = self.layout.image_archive();
            Packager::new(timestamp.mtime).pack(&self.layout.layers(), &dest)?;
            Some(dest)
        } else {
            None
        };

        info!(
            image_id = %image_id.short(),
            layers = layers.len(),
            packaged = archive.is_some(),
            elapsed_ms = started.elapsed().as_millis(),
            "Image assembled"
        );

        Ok(AssembledImage {
            image_id,
            layers,
            tree: self.layout.layers(),
            archive,
            created: timestamp.created.clone(),
        })
    }
}

/// Check the dependency shape of the image element and return its build
/// dependencies.
///
/// # Errors
///
/// Returns an error if there is no build dependency or if the element has
/// runtime dependencies.
pub fn check_shape<N: DependencyNode>(image: &N) -> QuarryResult<Vec<N>> {
    let build_deps = image.build_dependencies();
    if build_deps.is_empty() {
        return Err(QuarryError::BuildDependencyCount {
            element: image.name().to_string(),
            found: 0,
        });
    }

    let runtime = image.runtime_dependencies();
    if !runtime.is_empty() {
        return Err(QuarryError::RuntimeDependencies {
            element: image.name().to_string(),
            found: runtime.len(),
        });
    }

    Ok(build_deps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InMemoryGraph, NodeContents};

    #[test]
    fn image_needs_build_dependencies() {
        let mut graph = InMemoryGraph::new();
        let image = graph.add_node("image", NodeContents::Empty).unwrap();

        let err = check_shape(&graph.node(image)).unwrap_err();
        assert_eq!(err.reason(), "bdepend-wrong-count");
    }

    #[test]
    fn image_may_not_have_runtime_dependencies() {
        let mut graph = InMemoryGraph::new();
        let image = graph.add_node("image", NodeContents::Empty).unwrap();
        let base = graph.add_node("base", NodeContents::Empty).unwrap();
        graph.add_build_dependency(image, base);
        graph.add_runtime_dependency(image, base);

        let err = check_shape(&graph.node(image)).unwrap_err();
        assert_eq!(err.reason(), "rdepend-forbidden");
    }

    #[test]
    fn shape_returns_build_dependencies_in_order() {
        let mut graph = InMemoryGraph::new();
        let image = graph.add_node("image", NodeContents::Empty).unwrap();
        let b = graph.add_node("b", NodeContents::Empty).unwrap();
        let a = graph.add_node("a", NodeContents::Empty).unwrap();
        graph.add_build_dependency(image, b);
        graph.add_build_dependency(image, a);

        let deps = check_shape(&graph.node(image)).unwrap();
        let names: Vec<_> = deps.iter().map(DependencyNode::name).collect();
        assert_eq!(names, ["b", "a"]);
    }
}
