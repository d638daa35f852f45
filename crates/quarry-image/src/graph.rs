//! Dependency graph seams.
//!
//! The assembler never owns the dependency graph. It walks it through
//! [`DependencyNode`] and materializes nodes through a [`Stager`].
//! [`InMemoryGraph`] and [`ContentStager`] are the implementations used by
//! the CLI and by tests.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Component, Path, PathBuf};

use quarry_common::{QuarryError, QuarryResult};
use walkdir::WalkDir;

use crate::publish::unlock_tree;

/// A node of the build graph.
pub trait DependencyNode: Clone {
    /// Stable name, used as the deduplication key.
    fn name(&self) -> &str;

    /// Immediate build dependencies, declaration order.
    fn build_dependencies(&self) -> Vec<Self>;

    /// Immediate runtime dependencies, declaration order.
    fn runtime_dependencies(&self) -> Vec<Self>;
}

/// Materializes the files of one node.
pub trait Stager<N> {
    /// Write `node`'s own files (not its dependencies') under `dest`.
    ///
    /// Existing paths under `dest` are overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::Staging`] if the node cannot be materialized.
    fn stage(&self, node: &N, dest: &Path) -> QuarryResult<()>;
}

/// Index of a node in an [`InMemoryGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// The files a node contributes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NodeContents {
    /// Nothing.
    #[default]
    Empty,
    /// Everything below a directory on disk.
    Directory(PathBuf),
    /// Inline files, keyed by path relative to the image root.
    Files(BTreeMap<PathBuf, Vec<u8>>),
}

impl NodeContents {
    /// Build inline contents from `(path, bytes)` pairs.
    pub fn files<P, B>(files: impl IntoIterator<Item = (P, B)>) -> Self
    where
        P: Into<PathBuf>,
        B: Into<Vec<u8>>,
    {
        Self::Files(
            files
                .into_iter()
                .map(|(path, bytes)| (path.into(), bytes.into()))
                .collect(),
        )
    }
}

#[derive(Debug)]
struct NodeRecord {
    name: String,
    contents: NodeContents,
    build: Vec<NodeId>,
    runtime: Vec<NodeId>,
}

/// A dependency graph held in memory.
#[derive(Debug, Default)]
pub struct InMemoryGraph {
    nodes: Vec<NodeRecord>,
    by_name: HashMap<String, NodeId>,
}

impl InMemoryGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a node with the same name exists.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        contents: NodeContents,
    ) -> QuarryResult<NodeId> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(QuarryError::Config {
                message: format!("element '{name}' is declared twice"),
            });
        }

        let id = NodeId(self.nodes.len());
        self.by_name.insert(name.clone(), id);
        self.nodes.push(NodeRecord {
            name,
            contents,
            build: Vec::new(),
            runtime: Vec::new(),
        });
        Ok(id)
    }

    /// Declare that `from` build-depends on `to`.
    ///
    /// # Panics
    ///
    /// Panics if `from` was not created by this graph.
    pub fn add_build_dependency(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from.0].build.push(to);
    }

    /// Declare that `from` runtime-depends on `to`.
    ///
    /// # Panics
    ///
    /// Panics if `from` was not created by this graph.
    pub fn add_runtime_dependency(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from.0].runtime.push(to);
    }

    /// Handle to a node.
    #[must_use]
    pub const fn node(&self, id: NodeId) -> GraphNode<'_> {
        GraphNode { graph: self, id }
    }

    /// Look a node up by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<GraphNode<'_>> {
        self.by_name.get(name).map(|id| self.node(*id))
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn handles(&self, ids: &[NodeId]) -> Vec<GraphNode<'_>> {
        ids.iter().map(|id| self.node(*id)).collect()
    }
}

/// Borrowed handle to a node of an [`InMemoryGraph`].
#[derive(Clone, Copy)]
pub struct GraphNode<'g> {
    graph: &'g InMemoryGraph,
    id: NodeId,
}

impl<'g> GraphNode<'g> {
    /// Node id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// The files this node contributes.
    #[must_use]
    pub fn contents(&self) -> &'g NodeContents {
        &self.graph.nodes[self.id.0].contents
    }
}

impl DependencyNode for GraphNode<'_> {
    fn name(&self) -> &str {
        &self.graph.nodes[self.id.0].name
    }

    fn build_dependencies(&self) -> Vec<Self> {
        self.graph.handles(&self.graph.nodes[self.id.0].build)
    }

    fn runtime_dependencies(&self) -> Vec<Self> {
        self.graph.handles(&self.graph.nodes[self.id.0].runtime)
    }
}

impl fmt::Debug for GraphNode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

/// Stages [`NodeContents`] onto disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentStager;

impl ContentStager {
    const DIR_MODE: u32 = 0o755;
    const FILE_MODE: u32 = 0o644;
}

impl Stager<GraphNode<'_>> for ContentStager {
    fn stage(&self, node: &GraphNode<'_>, dest: &Path) -> QuarryResult<()> {
        stage_contents(node.contents(), dest)
            .map_err(|err| QuarryError::staging(node.name(), err))
    }
}

/// Directories staged by earlier nodes may be read-only. They are opened up
/// while `contents` is written and get their modes back afterwards, unless
/// `contents` brings its own mode for the same directory.
fn stage_contents(contents: &NodeContents, dest: &Path) -> io::Result<()> {
    let mut modes: BTreeMap<PathBuf, Permissions> = unlock_tree(dest)?.into_iter().collect();

    fs::create_dir_all(dest)?;
    match contents {
        NodeContents::Empty => {}
        NodeContents::Directory(source) => modes.extend(copy_tree(source, dest)?),
        NodeContents::Files(files) => write_files(files, dest)?,
    }

    // Children sort after their parents, so this restores deepest first.
    for (directory, permissions) in modes.into_iter().rev() {
        if fs::symlink_metadata(&directory).is_ok_and(|meta| meta.is_dir()) {
            fs::set_permissions(&directory, permissions)?;
        }
    }
    Ok(())
}

fn write_files(files: &BTreeMap<PathBuf, Vec<u8>>, dest: &Path) -> io::Result<()> {
    for (relative, bytes) in files {
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a relative path inside the image", relative.display()),
            ));
        }
        if let Some(parent) = relative.parent() {
            create_dirs(dest, parent)?;
        }

        let target = dest.join(relative);
        clear_for(&target, false)?;
        fs::write(&target, bytes)?;
        fs::set_permissions(&target, Permissions::from_mode(ContentStager::FILE_MODE))?;
    }
    Ok(())
}

/// Create `relative` below `dest` one level at a time. Every directory
/// created here gets [`ContentStager::DIR_MODE`], whatever the umask.
fn create_dirs(dest: &Path, relative: &Path) -> io::Result<()> {
    let mut current = dest.to_path_buf();
    for component in relative.components() {
        current.push(component);
        if fs::symlink_metadata(&current).is_ok_and(|meta| meta.is_dir()) {
            continue;
        }
        clear_for(&current, true)?;
        fs::create_dir(&current)?;
        fs::set_permissions(&current, Permissions::from_mode(ContentStager::DIR_MODE))?;
    }
    Ok(())
}

/// Copy `source` into `dest`, merging with what is already there.
///
/// Symlinks are copied as links. Returns the source permissions of every
/// copied directory; the caller applies them once the contents are in place.
fn copy_tree(source: &Path, dest: &Path) -> io::Result<Vec<(PathBuf, Permissions)>> {
    if !source.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", source.display()),
        ));
    }

    let mut directories = Vec::new();

    for entry in WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            clear_for(&target, true)?;
            if !target.is_dir() {
                fs::create_dir(&target)?;
            }
            fs::set_permissions(&target, Permissions::from_mode(ContentStager::DIR_MODE))?;
            directories.push((target, entry.metadata()?.permissions()));
        } else if file_type.is_symlink() {
            clear_for(&target, false)?;
            symlink(fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_file() {
            clear_for(&target, false)?;
            fs::copy(entry.path(), &target)?;
        } else {
            tracing::warn!(path = %entry.path().display(), "Skipping special file");
        }
    }

    Ok(directories)
}

/// Remove whatever sits at `target` unless it is already a directory and a
/// directory is wanted.
fn clear_for(target: &Path, want_dir: bool) -> io::Result<()> {
    let Ok(existing) = fs::symlink_metadata(target) else {
        return Ok(());
    };

    let file_type = existing.file_type();
    if file_type.is_dir() {
        if want_dir {
            return Ok(());
        }
        fs::remove_dir_all(target)
    } else {
        fs::remove_file(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn graph_edges_keep_declaration_order() {
        let mut graph = InMemoryGraph::new();
        let image = graph.add_node("image", NodeContents::Empty).unwrap();
        let a = graph.add_node("a", NodeContents::Empty).unwrap();
        let b = graph.add_node("b", NodeContents::Empty).unwrap();
        let c = graph.add_node("c", NodeContents::Empty).unwrap();
        graph.add_build_dependency(image, c);
        graph.add_build_dependency(image, a);
        graph.add_runtime_dependency(a, b);

        let image = graph.node(image);
        let names: Vec<_> = image
            .build_dependencies()
            .iter()
            .map(|n| n.name().to_string())
            .collect();
        assert_eq!(names, ["c", "a"]);
        assert_eq!(graph.find("a").unwrap().runtime_dependencies()[0].name(), "b");
        assert!(graph.find("missing").is_none());
        assert_eq!(graph.node_count(), 4);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut graph = InMemoryGraph::new();
        graph.add_node("a", NodeContents::Empty).unwrap();
        let err = graph.add_node("a", NodeContents::Empty).unwrap_err();
        assert_eq!(err.reason(), "config");
    }

    #[test]
    fn stages_inline_files_over_existing_paths() {
        let dest = TempDir::new().unwrap();
        let mut graph = InMemoryGraph::new();
        let first = graph
            .add_node("first", NodeContents::files([("etc/conf", "one"), ("etc/dir/x", "x")]))
            .unwrap();
        let second = graph
            .add_node("second", NodeContents::files([("etc/conf", "two"), ("etc/dir", "file")]))
            .unwrap();

        ContentStager.stage(&graph.node(first), dest.path()).unwrap();
        ContentStager.stage(&graph.node(second), dest.path()).unwrap();

        assert_eq!(fs::read_to_string(dest.path().join("etc/conf")).unwrap(), "two");
        assert_eq!(fs::read_to_string(dest.path().join("etc/dir")).unwrap(), "file");
    }

    #[test]
    fn copies_directories_with_links_and_modes() {
        let source = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("bin")).unwrap();
        fs::write(source.path().join("bin/app"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(
            source.path().join("bin/app"),
            fs::Permissions::from_mode(0o750),
        )
        .unwrap();
        symlink("app", source.path().join("bin/run")).unwrap();

        let mut graph = InMemoryGraph::new();
        let node = graph
            .add_node("app", NodeContents::Directory(source.path().to_path_buf()))
            .unwrap();

        let dest = TempDir::new().unwrap();
        ContentStager.stage(&graph.node(node), dest.path()).unwrap();

        let mode = fs::metadata(dest.path().join("bin/app"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o750);
        assert_eq!(
            fs::read_link(dest.path().join("bin/run")).unwrap(),
            PathBuf::from("app")
        );
    }

    #[test]
    fn missing_directory_is_a_staging_error() {
        let mut graph = InMemoryGraph::new();
        let node = graph
            .add_node("ghost", NodeContents::Directory("/nonexistent/quarry".into()))
            .unwrap();

        let dest = TempDir::new().unwrap();
        let err = ContentStager.stage(&graph.node(node), dest.path()).unwrap_err();
        assert_eq!(err.reason(), "staging-failed");
        assert!(err.to_string().contains("ghost"));
    }

    fn mode(path: &Path) -> u32 {
        fs::symlink_metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn implicit_directories_have_fixed_mode() {
        let dest = TempDir::new().unwrap();
        let mut graph = InMemoryGraph::new();
        let node = graph
            .add_node("doc", NodeContents::files([("usr/share/doc/README", "hi")]))
            .unwrap();

        ContentStager.stage(&graph.node(node), dest.path()).unwrap();

        for dir in ["usr", "usr/share", "usr/share/doc"] {
            assert_eq!(mode(&dest.path().join(dir)), 0o755, "{dir}");
        }
        assert_eq!(mode(&dest.path().join("usr/share/doc/README")), 0o644);
    }

    #[test]
    fn read_only_directories_accept_later_nodes() {
        let source = TempDir::new().unwrap();
        fs::create_dir_all(source.path().join("usr/bin")).unwrap();
        fs::write(source.path().join("usr/bin/tool"), "tool").unwrap();
        fs::set_permissions(source.path().join("usr/bin"), Permissions::from_mode(0o555)).unwrap();

        let mut graph = InMemoryGraph::new();
        let base = graph
            .add_node("base", NodeContents::Directory(source.path().to_path_buf()))
            .unwrap();
        let extra = graph
            .add_node("extra", NodeContents::files([("usr/bin/extra", "extra")]))
            .unwrap();

        let dest = TempDir::new().unwrap();
        ContentStager.stage(&graph.node(base), dest.path()).unwrap();
        assert_eq!(mode(&dest.path().join("usr/bin")), 0o555);

        ContentStager.stage(&graph.node(extra), dest.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dest.path().join("usr/bin/extra")).unwrap(),
            "extra"
        );
        assert_eq!(mode(&dest.path().join("usr/bin")), 0o555);

        crate::publish::remove_tree(dest.path()).unwrap();
        crate::publish::remove_tree(source.path()).unwrap();
    }

    #[test]
    fn inline_paths_stay_inside_the_image() {
        let mut graph = InMemoryGraph::new();
        let node = graph
            .add_node("evil", NodeContents::files([("../escape", "x")]))
            .unwrap();

        let dest = TempDir::new().unwrap();
        let err = ContentStager.stage(&graph.node(node), dest.path()).unwrap_err();
        assert_eq!(err.reason(), "staging-failed");
        assert!(!dest.path().join("../escape").exists());
    }
}
