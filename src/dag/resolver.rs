//! Dependency resolution for a requested subset of the catalog.
//!
//! The resolver walks the catalog depth-first from each requested id and
//! emits items in post-order, so every dependency lands before its
//! dependents. The walk tracks the ids on the active path; meeting one of
//! them again is a cycle, reported with the full path.

use crate::catalog::{Catalog, WorkItem};
use crate::errors::CatalogError;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Index into the resolved graph. Indices follow the topological order.
pub type NodeIndex = usize;

/// How strictly dangling dependency ids are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Fail on a dependency id that is not in the catalog. When false the
    /// edge is logged, recorded and dropped.
    pub strict_dependencies: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            strict_dependencies: true,
        }
    }
}

impl ResolveOptions {
    /// Lenient resolution: skip dependency ids missing from the catalog.
    pub fn lenient() -> Self {
        Self {
            strict_dependencies: false,
        }
    }
}

/// A dependency edge dropped during lenient resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDependency {
    pub item: String,
    pub dependency: String,
}

/// The resolved, acyclic dependency graph. Read-only once built.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Items in topological order
    items: Vec<WorkItem>,
    /// Map from item id to index
    index_map: HashMap<String, NodeIndex>,
    /// Forward edges: index -> items that depend on it
    forward_edges: Vec<Vec<NodeIndex>>,
    /// Reverse edges: index -> items it depends on
    reverse_edges: Vec<Vec<NodeIndex>>,
    skipped: Vec<SkippedDependency>,
}

impl DependencyGraph {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Get an item by its index.
    pub fn get_item(&self, index: NodeIndex) -> Option<&WorkItem> {
        self.items.get(index)
    }

    /// Get the index for an item id.
    pub fn get_index(&self, id: &str) -> Option<NodeIndex> {
        self.index_map.get(id).copied()
    }

    /// All items, in execution order.
    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    /// Item ids in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.items.iter().map(|i| i.id.as_str()).collect()
    }

    /// Items that depend on the given item.
    pub fn dependents(&self, index: NodeIndex) -> &[NodeIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Items the given item depends on.
    pub fn dependencies(&self, index: NodeIndex) -> &[NodeIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Dependency ids of an item, after lenient filtering.
    pub fn dependency_ids(&self, id: &str) -> Vec<&str> {
        self.get_index(id)
            .map(|i| {
                self.dependencies(i)
                    .iter()
                    .map(|&d| self.items[d].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Items with no dependencies.
    pub fn root_nodes(&self) -> Vec<NodeIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Items nothing else depends on.
    pub fn leaf_nodes(&self) -> Vec<NodeIndex> {
        self.forward_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Check if all dependencies of an item are in `completed`.
    pub fn dependencies_satisfied(&self, index: NodeIndex, completed: &HashSet<NodeIndex>) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }

    /// Every item reachable through forward edges, excluding `index` itself.
    pub fn transitive_dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeIndex> = self.dependents(index).to_vec();
        let mut out = Vec::new();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                out.push(next);
                stack.extend_from_slice(self.dependents(next));
            }
        }
        out.sort_unstable();
        out
    }

    /// Dependency edges dropped during lenient resolution.
    pub fn skipped_dependencies(&self) -> &[SkippedDependency] {
        &self.skipped
    }

    /// Partition the graph into strict waves.
    ///
    /// Wave `n` holds every item whose dependencies all sit in waves before
    /// `n`. Used for plan previews; execution itself does not wait on wave
    /// boundaries.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut completed: HashSet<NodeIndex> = HashSet::new();

        loop {
            let ready: Vec<NodeIndex> = (0..self.items.len())
                .filter(|i| !completed.contains(i) && self.dependencies_satisfied(*i, &completed))
                .collect();

            if ready.is_empty() {
                break;
            }

            completed.extend(ready.iter().copied());
            waves.push(ready.iter().map(|&i| self.items[i].id.clone()).collect());
        }

        waves
    }
}

/// Resolves requested ids against a catalog into a [`DependencyGraph`].
pub struct DependencyResolver<'c> {
    catalog: &'c Catalog,
    options: ResolveOptions,
}

impl<'c> DependencyResolver<'c> {
    pub fn new(catalog: &'c Catalog) -> Self {
        Self {
            catalog,
            options: ResolveOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ResolveOptions) -> Self {
        self.options = options;
        self
    }

    /// Resolve every item in the catalog.
    pub fn resolve_all(&self) -> Result<DependencyGraph, CatalogError> {
        let ids = self.catalog.ids();
        self.resolve(&ids)
    }

    /// Resolve the requested ids plus all their transitive dependencies.
    ///
    /// For a fixed catalog and a fixed request order the output order is
    /// always the same.
    pub fn resolve<S: AsRef<str>>(&self, requested: &[S]) -> Result<DependencyGraph, CatalogError> {
        let unknown: Vec<String> = requested
            .iter()
            .map(|s| s.as_ref())
            .filter(|id| !self.catalog.contains(id))
            .map(String::from)
            .collect();
        if !unknown.is_empty() {
            return Err(CatalogError::UnknownIds {
                ids: unknown,
                valid: self.catalog.ids(),
            });
        }

        let mut walk = Walk {
            catalog: self.catalog,
            strict: self.options.strict_dependencies,
            visiting: HashSet::new(),
            path: Vec::new(),
            done: HashSet::new(),
            order: Vec::new(),
            skipped: Vec::new(),
        };

        for id in requested {
            walk.visit(id.as_ref())?;
        }

        debug!(
            requested = requested.len(),
            resolved = walk.order.len(),
            "Resolved dependency order"
        );

        Ok(build_graph(self.catalog, &walk.order, walk.skipped))
    }
}

/// Depth-first post-order walk state.
struct Walk<'c> {
    catalog: &'c Catalog,
    strict: bool,
    /// Ids on the active path
    visiting: HashSet<&'c str>,
    /// Active path in visit order, for cycle rendering
    path: Vec<&'c str>,
    done: HashSet<&'c str>,
    order: Vec<&'c str>,
    skipped: Vec<SkippedDependency>,
}

impl<'c> Walk<'c> {
    /// Post-order walk from `root` on an explicit stack. Each frame holds an
    /// item and the index of its next dependency to visit; `path` mirrors
    /// the stack so a cycle can be rendered in full.
    fn visit(&mut self, root: &str) -> Result<(), CatalogError> {
        let Some(item) = self.catalog.get(root) else {
            return Err(CatalogError::UnknownIds {
                ids: vec![root.to_string()],
                valid: self.catalog.ids(),
            });
        };
        if self.done.contains(item.id.as_str()) {
            return Ok(());
        }

        let mut stack: Vec<(&'c WorkItem, usize)> = vec![(item, 0)];
        self.visiting.insert(item.id.as_str());
        self.path.push(item.id.as_str());

        loop {
            let Some(frame) = stack.last_mut() else {
                break;
            };
            let (item, cursor) = *frame;
            frame.1 += 1;
            let id = item.id.as_str();

            let Some(dep) = item.dependencies.get(cursor) else {
                stack.pop();
                self.path.pop();
                self.visiting.remove(id);
                self.done.insert(id);
                self.order.push(id);
                continue;
            };

            let Some(dep_item) = self.catalog.get(dep) else {
                if self.strict {
                    return Err(CatalogError::UnknownDependency {
                        item: id.to_string(),
                        dependency: dep.clone(),
                        valid: self.catalog.ids(),
                    });
                }
                warn!(item = id, dependency = %dep, "Skipping dependency missing from catalog");
                self.skipped.push(SkippedDependency {
                    item: id.to_string(),
                    dependency: dep.clone(),
                });
                continue;
            };
            let dep_id = dep_item.id.as_str();

            if self.done.contains(dep_id) {
                continue;
            }
            if self.visiting.contains(dep_id) {
                let start = self.path.iter().position(|p| *p == dep_id).unwrap_or(0);
                let mut path: Vec<String> =
                    self.path[start..].iter().map(|p| p.to_string()).collect();
                path.push(dep_id.to_string());
                return Err(CatalogError::Cycle { path });
            }

            self.visiting.insert(dep_id);
            self.path.push(dep_id);
            stack.push((dep_item, 0));
        }

        Ok(())
    }
}

fn build_graph(catalog: &Catalog, order: &[&str], skipped: Vec<SkippedDependency>) -> DependencyGraph {
    let items: Vec<WorkItem> = order
        .iter()
        .filter_map(|id| catalog.get(id).cloned())
        .collect();

    let index_map: HashMap<String, NodeIndex> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.id.clone(), i))
        .collect();

    let mut forward_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); items.len()];
    let mut reverse_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); items.len()];

    for (to_idx, item) in items.iter().enumerate() {
        for dep in &item.dependencies {
            let Some(&from_idx) = index_map.get(dep) else {
                continue;
            };
            if reverse_edges[to_idx].contains(&from_idx) {
                continue;
            }
            forward_edges[from_idx].push(to_idx);
            reverse_edges[to_idx].push(from_idx);
        }
    }

    DependencyGraph {
        items,
        index_map,
        forward_edges,
        reverse_edges,
        skipped,
    }
}
