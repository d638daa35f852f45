//! Imagefile parsing.
//!
//! An Imagefile declares the image settings, the ordered build dependencies
//! of the image element and the elements of the dependency graph:
//!
//! ```yaml
//! image:
//!   image-names: ['app:1.0']
//!   cmd: [/bin/app]
//!   timestamp: deterministic
//! depends: [app]
//! elements:
//!   app:
//!     path: rootfs/app
//!     runtime: [libfoo]
//!   libfoo:
//!     files:
//!       lib/libfoo.so: "..."
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use quarry_common::{QuarryError, QuarryResult};
use quarry_image::graph::NodeId;
use quarry_image::{ImageSettings, InMemoryGraph, NodeContents};
use serde::{Deserialize, Serialize};

/// Default name of the image element.
pub const DEFAULT_IMAGE_ELEMENT: &str = "image";

/// A parsed Imagefile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Imagefile {
    /// Name of the image element.
    #[serde(default = "default_image_element")]
    pub name: String,

    /// Image settings.
    #[serde(default)]
    pub image: ImageSettings,

    /// Build dependencies of the image element, bottom layer first.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Elements of the dependency graph.
    #[serde(default)]
    pub elements: BTreeMap<String, ElementSpec>,
}

/// One element of the dependency graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ElementSpec {
    /// Directory with the element's files, relative to the Imagefile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Inline text files, keyed by path inside the image.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<PathBuf, String>,

    /// Runtime dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtime: Vec<String>,
}

fn default_image_element() -> String {
    DEFAULT_IMAGE_ELEMENT.to_string()
}

impl Imagefile {
    /// Load from file, auto-detecting format by extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> QuarryResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| QuarryError::io_at(path, e))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");

        match ext.to_lowercase().as_str() {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse from YAML.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the content is not a valid Imagefile.
    pub fn from_yaml(content: &str) -> QuarryResult<Self> {
        let value: serde_json::Value =
            serde_yaml::from_str(content).map_err(|e| QuarryError::Config {
                message: format!("Failed to parse YAML structure: {e}"),
            })?;

        serde_json::from_value(value).map_err(|e| QuarryError::Config {
            message: format!("Failed to interpret YAML as Imagefile: {e}"),
        })
    }

    /// Parse from TOML.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the content is not a valid Imagefile.
    pub fn from_toml(content: &str) -> QuarryResult<Self> {
        toml::from_str(content).map_err(|e| QuarryError::Config {
            message: format!("Failed to parse TOML: {e}"),
        })
    }

    /// Parse from JSON.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the content is not a valid Imagefile.
    pub fn from_json(content: &str) -> QuarryResult<Self> {
        serde_json::from_str(content).map_err(|e| QuarryError::Config {
            message: format!("Failed to parse JSON: {e}"),
        })
    }

    /// Serialize to YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> QuarryResult<String> {
        serde_yaml::to_string(self).map_err(|e| QuarryError::Internal {
            message: format!("Failed to serialize to YAML: {e}"),
        })
    }

    /// Build the dependency graph. Element paths are resolved against
    /// `base_dir`. Returns the graph and the image element.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for duplicate element names, elements
    /// with both `path` and `files`, and references to unknown elements.
    pub fn graph(&self, base_dir: &Path) -> QuarryResult<(InMemoryGraph, NodeId)> {
        let mut graph = InMemoryGraph::new();
        let image = graph.add_node(self.name.clone(), NodeContents::Empty)?;

        for (name, element) in &self.elements {
            graph.add_node(name.clone(), element.contents(name, base_dir)?)?;
        }

        for dependency in &self.depends {
            let to = lookup(&graph, dependency, &self.name)?;
            graph.add_build_dependency(image, to);
        }

        for (name, element) in &self.elements {
            let from = lookup(&graph, name, name)?;
            for dependency in &element.runtime {
                let to = lookup(&graph, dependency, name)?;
                graph.add_runtime_dependency(from, to);
            }
        }

        Ok((graph, image))
    }
}

impl ElementSpec {
    fn contents(&self, name: &str, base_dir: &Path) -> QuarryResult<NodeContents> {
        match (&self.path, self.files.is_empty()) {
            (Some(_), false) => Err(QuarryError::Config {
                message: format!("element '{name}' declares both 'path' and 'files'"),
            }),
            (Some(path), true) => Ok(NodeContents::Directory(base_dir.join(path))),
            (None, false) => Ok(NodeContents::files(
                self.files
                    .iter()
                    .map(|(path, text)| (path.clone(), text.as_bytes().to_vec())),
            )),
            (None, true) => Ok(NodeContents::Empty),
        }
    }
}

fn lookup(graph: &InMemoryGraph, name: &str, referrer: &str) -> QuarryResult<NodeId> {
    graph
        .find(name)
        .map(|node| node.id())
        .ok_or_else(|| QuarryError::Config {
            message: format!("'{referrer}' depends on unknown element '{name}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_image::DependencyNode;

    const YAML: &str = r"
image:
  image-names: ['app:1.0']
  exposed-ports: [8080]
  timestamp: deterministic
depends: [app, tools]
elements:
  app:
    path: rootfs/app
    runtime: [libfoo]
  libfoo:
    files:
      lib/libfoo.so: foo
  tools: {}
";

    #[test]
    fn parses_yaml() {
        let imagefile = Imagefile::from_yaml(YAML).unwrap();
        assert_eq!(imagefile.name, "image");
        assert_eq!(imagefile.depends, ["app", "tools"]);
        assert_eq!(imagefile.image.exposed_ports, ["8080"]);
        assert_eq!(
            imagefile.elements["app"].path.as_deref(),
            Some(Path::new("rootfs/app"))
        );
    }

    #[test]
    fn parses_toml() {
        let toml = r#"
depends = ["app"]

[image]
image-names = ["app"]

[elements.app]
files = { "bin/app" = "app" }
"#;
        let imagefile = Imagefile::from_toml(toml).unwrap();
        assert_eq!(imagefile.image.image_names, ["app"]);
        assert_eq!(imagefile.elements["app"].files.len(), 1);
    }

    #[test]
    fn yaml_round_trip() {
        let imagefile = Imagefile::from_yaml(YAML).unwrap();
        let again = Imagefile::from_yaml(&imagefile.to_yaml().unwrap()).unwrap();
        assert_eq!(again, imagefile);
    }

    #[test]
    fn builds_graph() {
        let imagefile = Imagefile::from_yaml(YAML).unwrap();
        let (graph, image) = imagefile.graph(Path::new("/work")).unwrap();

        let image = graph.node(image);
        let deps: Vec<_> = image
            .build_dependencies()
            .iter()
            .map(|n| n.name().to_string())
            .collect();
        assert_eq!(deps, ["app", "tools"]);

        let app = graph.find("app").unwrap();
        assert_eq!(
            app.contents(),
            &NodeContents::Directory(PathBuf::from("/work/rootfs/app"))
        );
        assert_eq!(app.runtime_dependencies()[0].name(), "libfoo");
    }

    #[test]
    fn unknown_references_rejected() {
        let yaml = "depends: [ghost]\nimage:\n  image-names: [app]\n";
        let err = Imagefile::from_yaml(yaml)
            .unwrap()
            .graph(Path::new("."))
            .unwrap_err();
        assert_eq!(err.reason(), "config");
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = Imagefile::from_yaml("image:\n  tag: [x]\n").unwrap_err();
        assert_eq!(err.reason(), "config");
    }

    #[test]
    fn path_and_files_are_exclusive() {
        let yaml = "elements:\n  a:\n    path: x\n    files: {y: z}\n";
        let err = Imagefile::from_yaml(yaml)
            .unwrap()
            .graph(Path::new("."))
            .unwrap_err();
        assert!(err.to_string().contains("both"));
    }
}
