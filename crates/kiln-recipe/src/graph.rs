//! Dependency graph construction.
//!
//! The graph is built breadth-first. All requirements of one level are
//! resolved against the package source in parallel, then merged into the
//! graph one by one in declaration order, so the resulting graph and any
//! reported conflict do not depend on which lookup finished first.

use crate::cancel::{CancellationToken, Cancelled};
use crate::coalesce::ResolutionCache;
use crate::options::{resolve, OptionError, OptionOverrides, ResolvedConfiguration};
use crate::recipe::{Requirement, RequirementKind};
use crate::reference::PackageIdentity;
use crate::settings::Settings;
use crate::source::{PackageSource, SourceError, SourcePackage};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while building a dependency graph.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error(
        "version conflict for '{package}': {existing} required via {}, but {requested} required via {}",
        .existing_path.join(" -> "),
        .requested_path.join(" -> ")
    )]
    VersionConflict {
        package: String,
        existing: String,
        existing_path: Vec<String>,
        requested: String,
        requested_path: Vec<String>,
    },

    #[error("cannot resolve '{package}' (required via {}): {reason}", .path.join(" -> "))]
    UnresolvedPackage {
        package: String,
        path: Vec<String>,
        reason: String,
    },

    #[error(transparent)]
    Option(#[from] OptionError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// A dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Edge {
    /// Index of the required node.
    pub target: usize,
    pub kind: RequirementKind,
}

/// One package in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    pub identity: PackageIdentity,
    pub config: ResolvedConfiguration,
    /// Where the package's files live.
    pub output: Option<PathBuf>,
    pub dependencies: Vec<Edge>,
    /// Package names from the root to the requirement that first added
    /// this node.
    pub path: Vec<String>,
}

/// A resolved dependency graph. Node 0 is the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    #[serde(skip)]
    index: BTreeMap<String, usize>,
}

impl DependencyGraph {
    /// A graph holding only the root package.
    #[must_use]
    pub fn new(root: ResolvedConfiguration, output: Option<PathBuf>) -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            index: BTreeMap::new(),
        };
        let path = vec![root.identity().name.clone()];
        graph.add_node(root, output, path);
        graph
    }

    pub(crate) fn add_node(
        &mut self,
        config: ResolvedConfiguration,
        output: Option<PathBuf>,
        path: Vec<String>,
    ) -> usize {
        let index = self.nodes.len();
        let identity = config.identity().clone();
        self.index.insert(identity.name.clone(), index);
        self.nodes.push(GraphNode {
            identity,
            config,
            output,
            dependencies: Vec::new(),
            path,
        });
        index
    }

    pub(crate) fn add_edge(&mut self, from: usize, target: usize, kind: RequirementKind) {
        let edge = Edge { target, kind };
        let dependencies = &mut self.nodes[from].dependencies;
        if !dependencies.contains(&edge) {
            dependencies.push(edge);
        }
    }

    /// The root node.
    #[must_use]
    pub fn root(&self) -> &GraphNode {
        &self.nodes[0]
    }

    /// A node by index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn node(&self, index: usize) -> &GraphNode {
        &self.nodes[index]
    }

    /// All nodes in breadth-first order, root first.
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Every node except the root, in breadth-first order.
    pub fn dependencies(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter().skip(1)
    }

    /// Look up a node by package name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&GraphNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Index of a node by package name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Number of nodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// `(package, option)` pairs in `overrides` addressed to no node.
    #[must_use]
    pub fn unmatched_overrides(&self, overrides: &OptionOverrides) -> Vec<(String, String)> {
        overrides
            .iter()
            .filter(|(package, _, _)| self.get(package).is_none())
            .map(|(package, option, _)| (package.to_string(), option.to_string()))
            .collect()
    }

    /// Always false: a graph has at least its root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Builds a [`DependencyGraph`] against a [`PackageSource`].
pub struct GraphBuilder<'a> {
    source: &'a dyn PackageSource,
    settings: Settings,
    overrides: OptionOverrides,
    cancel: CancellationToken,
}

impl<'a> GraphBuilder<'a> {
    /// Create a builder resolving every package under `settings`.
    #[must_use]
    pub fn new(source: &'a dyn PackageSource, settings: Settings) -> Self {
        Self {
            source,
            settings,
            overrides: OptionOverrides::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Caller overrides. These take precedence over every recipe.
    #[must_use]
    pub fn with_overrides(mut self, overrides: OptionOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Token checked before each level and passed to the source.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the graph below `root`, whose configuration is already resolved.
    pub fn build(
        &self,
        root: &SourcePackage,
        root_config: ResolvedConfiguration,
    ) -> Result<DependencyGraph, GraphError> {
        let cache = ResolutionCache::new();
        let mut overrides = self.overrides.clone();
        overrides.merge_missing(&root.dependency_options);

        let mut graph = DependencyGraph::new(root_config, root.output.clone());
        let mut level: Vec<(usize, Requirement)> = root
            .requirements
            .iter()
            .map(|requirement| (0, requirement.clone()))
            .collect();
        let mut depth = 0;

        while !level.is_empty() {
            self.cancel.check()?;
            depth += 1;
            debug!("Resolving {} requirement(s) at depth {}", level.len(), depth);

            // Lookups run in parallel; only names not yet in the graph and
            // not closing a cycle need one.
            let lookups: Vec<Option<Result<Arc<SourcePackage>, SourceError>>> = level
                .par_iter()
                .map(|(parent, requirement)| {
                    let name = requirement.name();
                    if graph.get(name).is_some() || graph.node(*parent).path.iter().any(|n| n == name)
                    {
                        return None;
                    }
                    Some(self.lookup(&cache, requirement))
                })
                .collect();

            let mut next = Vec::new();
            for ((parent, requirement), lookup) in level.into_iter().zip(lookups) {
                let name = requirement.name().to_string();
                let mut path = graph.node(parent).path.clone();
                path.push(name.clone());

                if graph.node(parent).path.contains(&name) {
                    return Err(GraphError::UnresolvedPackage {
                        package: name,
                        path,
                        reason: "dependency cycle".to_string(),
                    });
                }

                if let Some(existing) = graph.index_of(&name) {
                    let node = graph.node(existing);
                    if !requirement.reference.is_satisfied_by(&node.identity) {
                        return Err(GraphError::VersionConflict {
                            package: name,
                            existing: node.identity.to_string(),
                            existing_path: node.path.clone(),
                            requested: requirement.reference.to_string(),
                            requested_path: path,
                        });
                    }
                    graph.add_edge(parent, existing, requirement.kind);
                    continue;
                }

                let lookup = match lookup {
                    Some(lookup) => lookup,
                    None => self.lookup(&cache, &requirement),
                };
                let package = lookup.map_err(|e| match e {
                    SourceError::Cancelled(c) => GraphError::Cancelled(c),
                    other => GraphError::UnresolvedPackage {
                        package: name.clone(),
                        path: path.clone(),
                        reason: other.to_string(),
                    },
                })?;

                let config = resolve(
                    &package.identity,
                    &package.option_schema,
                    &overrides,
                    &self.settings.restricted_to(&package.settings),
                )?;
                debug!("Adding {} via {}", package.identity, path.join(" -> "));
                let index = graph.add_node(config, package.output.clone(), path);
                graph.add_edge(parent, index, requirement.kind);

                merge_downstream(&mut overrides, &package.dependency_options, &graph, &name)?;
                next.extend(
                    package
                        .requirements
                        .iter()
                        .map(|requirement| (index, requirement.clone())),
                );
            }
            level = next;
        }

        for (package, option) in graph.unmatched_overrides(&self.overrides) {
            warn!("Override {}:{} matches no package in the graph", package, option);
        }
        info!(
            "Resolved {} package(s) for {}",
            graph.len() - 1,
            graph.root().identity
        );
        Ok(graph)
    }

    fn lookup(
        &self,
        cache: &ResolutionCache,
        requirement: &Requirement,
    ) -> Result<Arc<SourcePackage>, SourceError> {
        cache.resolve(&requirement.reference, || {
            self.source.resolve(&requirement.reference, &self.cancel)
        })
    }
}

/// Fold a package's overrides for its dependencies into the accumulated set.
///
/// Values already present came from closer to the root, or from a sibling
/// declared earlier, and win. A value for a package that is already resolved
/// must agree with its configuration.
fn merge_downstream(
    overrides: &mut OptionOverrides,
    downstream: &OptionOverrides,
    graph: &DependencyGraph,
    from: &str,
) -> Result<(), OptionError> {
    for (package, option, value) in downstream.iter() {
        if let Some(kept) = overrides.get(package, option) {
            if kept != value {
                warn!(
                    "'{}' requests {}:{}={}, keeping {}",
                    from, package, option, value, kept
                );
            }
            continue;
        }
        if let Some(node) = graph.get(package) {
            let current = node.config.option(option);
            if current.map(ToString::to_string) != Some(value.to_string()) {
                return Err(OptionError::Conflict {
                    package: package.to_string(),
                    option: option.to_string(),
                    reason: format!(
                        "'{from}' requests {value} after '{package}' was resolved with {}",
                        current.map_or_else(|| "no such option".to_string(), ToString::to_string)
                    ),
                });
            }
        }
        overrides.set(package, option, value.clone());
    }
    Ok(())
}
