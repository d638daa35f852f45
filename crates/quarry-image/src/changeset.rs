//! Changeset collection.
//!
//! Each immediate build dependency of the image element becomes one
//! changeset: the union of its own files and those of its transitive
//! runtime dependencies, minus anything an earlier changeset already
//! claimed. Index 0 is the bottom-most layer.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use quarry_common::paths::normal_name;
use quarry_common::{AssemblyLayout, QuarryError, QuarryResult};
use tracing::{debug, info};

use crate::graph::{DependencyNode, Stager};
use crate::publish::remove_tree;

/// Names of nodes that already contributed to a changeset of this run.
#[derive(Debug, Clone, Default)]
pub struct ClaimSet(HashSet<String>);

impl ClaimSet {
    /// Create an empty claim set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name`. Returns `false` if it was already claimed.
    pub fn claim(&mut self, name: &str) -> bool {
        if self.0.contains(name) {
            return false;
        }
        self.0.insert(name.to_string())
    }

    /// Number of claimed nodes.
    #[must_use]
    pub fn claimed(&self) -> usize {
        self.0.len()
    }
}

/// Nodes to stage for one build dependency, in staging order.
#[derive(Debug, Clone)]
pub struct LayerPlan<N> {
    /// Name of the build dependency.
    pub name: String,
    /// Nodes to stage, dependencies before dependents.
    pub nodes: Vec<N>,
}

struct Frame<N> {
    node: N,
    children: Vec<N>,
    next: usize,
}

impl<N: DependencyNode> Frame<N> {
    fn enter(node: N) -> Self {
        let children = node.runtime_dependencies();
        Self {
            node,
            children,
            next: 0,
        }
    }
}

/// Plan one changeset per build dependency.
///
/// Runtime edges are walked depth-first with an explicit stack. A node is
/// claimed when first reached and emitted after all of its runtime
/// dependencies, so cycles terminate and dependencies stage first. A build
/// dependency whose closure is entirely claimed yields an empty plan.
pub fn plan<N: DependencyNode>(build_deps: &[N], claims: &mut ClaimSet) -> Vec<LayerPlan<N>> {
    build_deps
        .iter()
        .map(|root| {
            let mut nodes = Vec::new();
            let mut stack = Vec::new();
            if claims.claim(root.name()) {
                stack.push(Frame::enter(root.clone()));
            }

            loop {
                let Some(frame) = stack.last_mut() else {
                    break;
                };
                if let Some(child) = frame.children.get(frame.next).cloned() {
                    frame.next += 1;
                    if claims.claim(child.name()) {
                        stack.push(Frame::enter(child));
                    }
                } else if let Some(done) = stack.pop() {
                    nodes.push(done.node);
                }
            }

            LayerPlan {
                name: root.name().to_string(),
                nodes,
            }
        })
        .collect()
}

/// A staged directory tree that becomes one layer.
#[derive(Debug, Clone)]
pub struct Changeset {
    /// Name of the build dependency.
    pub name: String,
    /// Staging root; maps to `/` in the image.
    pub root: PathBuf,
    /// Nodes staged into this changeset, staging order.
    pub contributors: Vec<String>,
}

/// Stages planned changesets under the run's `dependencies/` directory.
pub struct ChangesetCollector<'a, S> {
    layout: &'a AssemblyLayout,
    stager: &'a S,
}

impl<'a, S> ChangesetCollector<'a, S> {
    /// Create a collector.
    pub const fn new(layout: &'a AssemblyLayout, stager: &'a S) -> Self {
        Self { layout, stager }
    }

    /// Stage one changeset per build dependency.
    ///
    /// # Errors
    ///
    /// Staging errors are returned unchanged; I/O errors on the staging
    /// directories are wrapped with their path.
    pub fn collect<N>(&self, build_deps: &[N], claims: &mut ClaimSet) -> QuarryResult<Vec<Changeset>>
    where
        N: DependencyNode,
        S: Stager<N>,
    {
        let started = Instant::now();
        let plans = plan(build_deps, claims);
        let mut changesets = Vec::with_capacity(plans.len());

        for (index, plan) in plans.into_iter().enumerate() {
            let root = self
                .layout
                .dependency(&format!("{index:03}-{}", normal_name(&plan.name)));
            remove_tree(&root)?;
            fs::create_dir_all(&root).map_err(|e| QuarryError::io_at(&root, e))?;

            let mut contributors = Vec::with_capacity(plan.nodes.len());
            for node in &plan.nodes {
                debug!(changeset = %plan.name, node = node.name(), "Staging node");
                self.stager.stage(node, &root)?;
                contributors.push(node.name().to_string());
            }

            debug!(
                changeset = %plan.name,
                nodes = contributors.len(),
                root = %root.display(),
                "Changeset staged"
            );
            changesets.push(Changeset {
                name: plan.name,
                root,
                contributors,
            });
        }

        info!(
            changesets = changesets.len(),
            claimed = claims.claimed(),
            elapsed_ms = started.elapsed().as_millis(),
            "Collected changesets"
        );
        Ok(changesets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ContentStager, GraphNode, InMemoryGraph, NodeContents};
    use tempfile::TempDir;

    fn names<'a>(plan: &'a LayerPlan<GraphNode<'_>>) -> Vec<&'a str> {
        plan.nodes.iter().map(DependencyNode::name).collect()
    }

    fn empty(graph: &mut InMemoryGraph, name: &str) -> crate::graph::NodeId {
        graph.add_node(name, NodeContents::Empty).unwrap()
    }

    #[test]
    fn runtime_dependencies_stage_first() {
        let mut graph = InMemoryGraph::new();
        let a = empty(&mut graph, "a");
        let b = empty(&mut graph, "b");
        let c = empty(&mut graph, "c");
        graph.add_runtime_dependency(a, b);
        graph.add_runtime_dependency(b, c);

        let plans = plan(&[graph.node(a)], &mut ClaimSet::new());
        assert_eq!(plans.len(), 1);
        assert_eq!(names(&plans[0]), ["c", "b", "a"]);
    }

    #[test]
    fn diamond_claims_shared_node_once() {
        let mut graph = InMemoryGraph::new();
        let a = empty(&mut graph, "a");
        let b = empty(&mut graph, "b");
        let c = empty(&mut graph, "c");
        graph.add_runtime_dependency(a, b);
        graph.add_runtime_dependency(c, b);

        let mut claims = ClaimSet::new();
        let plans = plan(&[graph.node(a), graph.node(c)], &mut claims);
        assert_eq!(names(&plans[0]), ["b", "a"]);
        assert_eq!(names(&plans[1]), ["c"]);
        assert_eq!(claims.claimed(), 3);
    }

    #[test]
    fn claimed_build_dependency_yields_empty_plan() {
        let mut graph = InMemoryGraph::new();
        let a = empty(&mut graph, "a");
        let b = empty(&mut graph, "b");
        graph.add_runtime_dependency(a, b);

        let plans = plan(&[graph.node(a), graph.node(b)], &mut ClaimSet::new());
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[1].name, "b");
        assert!(plans[1].nodes.is_empty());
    }

    #[test]
    fn runtime_cycles_terminate() {
        let mut graph = InMemoryGraph::new();
        let a = empty(&mut graph, "a");
        let b = empty(&mut graph, "b");
        graph.add_runtime_dependency(a, b);
        graph.add_runtime_dependency(b, a);
        graph.add_runtime_dependency(b, b);

        let plans = plan(&[graph.node(a)], &mut ClaimSet::new());
        assert_eq!(names(&plans[0]), ["b", "a"]);
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        let mut graph = InMemoryGraph::new();
        let ids: Vec<_> = (0..10_000)
            .map(|i| empty(&mut graph, &format!("n{i}")))
            .collect();
        for pair in ids.windows(2) {
            graph.add_runtime_dependency(pair[0], pair[1]);
        }

        let plans = plan(&[graph.node(ids[0])], &mut ClaimSet::new());
        assert_eq!(plans[0].nodes.len(), 10_000);
        assert_eq!(plans[0].nodes[0].name(), "n9999");
        assert_eq!(plans[0].nodes[9_999].name(), "n0");
    }

    #[test]
    fn collector_stages_later_nodes_over_earlier() {
        let run = TempDir::new().unwrap();
        let layout = AssemblyLayout::with_root(run.path());

        let mut graph = InMemoryGraph::new();
        let app = graph
            .add_node("app", NodeContents::files([("etc/motd", "from app")]))
            .unwrap();
        let base = graph
            .add_node("base/libs.bst", NodeContents::files([("etc/motd", "from base")]))
            .unwrap();
        graph.add_runtime_dependency(app, base);

        let changesets = ChangesetCollector::new(&layout, &ContentStager)
            .collect(&[graph.node(app)], &mut ClaimSet::new())
            .unwrap();

        assert_eq!(changesets.len(), 1);
        assert_eq!(changesets[0].contributors, ["base/libs.bst", "app"]);
        assert!(changesets[0].root.ends_with("dependencies/000-app"));
        assert_eq!(
            fs::read_to_string(changesets[0].root.join("etc/motd")).unwrap(),
            "from app"
        );
    }

    #[test]
    fn collector_propagates_staging_errors() {
        let run = TempDir::new().unwrap();
        let layout = AssemblyLayout::with_root(run.path());

        let mut graph = InMemoryGraph::new();
        let broken = graph
            .add_node("broken", NodeContents::Directory("/nonexistent/quarry".into()))
            .unwrap();

        let err = ChangesetCollector::new(&layout, &ContentStager)
            .collect(&[graph.node(broken)], &mut ClaimSet::new())
            .unwrap_err();
        assert_eq!(err.reason(), "staging-failed");
    }
}
