//! Node state machine and ready-set computation.
//!
//! The scheduler owns every [`TaskNode`] of a run. Only the scheduling loop
//! mutates it, so transitions never race. Nodes move strictly forward:
//!
//! ```text
//! Pending -> Running -> Complete
//! Pending -> Running -> Failed
//! Pending -> Failed            (cascade, cancellation, unresolved)
//! ```

use crate::catalog::{Catalog, WorkItem};
use crate::dag::resolver::{DependencyGraph, DependencyResolver, NodeIndex, ResolveOptions};
use crate::errors::{CatalogError, InvalidTransition, NodeFailure};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Coarse status of a node, as reported in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full state of a node. Output and failure only exist in the matching state.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum NodeState {
    /// Waiting for dependencies or a free worker
    #[default]
    Pending,
    /// Dispatched to a worker
    Running { started_at_ms: u64 },
    /// Finished with output
    Complete { output: String },
    /// Finished without output
    Failed { failure: NodeFailure },
}

impl NodeState {
    pub fn status(&self) -> NodeStatus {
        match self {
            Self::Pending => NodeStatus::Pending,
            Self::Running { .. } => NodeStatus::Running,
            Self::Complete { .. } => NodeStatus::Complete,
            Self::Failed { .. } => NodeStatus::Failed,
        }
    }

    /// Check if the node is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Failed { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

/// Runtime wrapper around a work item.
#[derive(Debug, Clone)]
pub struct TaskNode {
    /// The item definition
    pub item: WorkItem,
    /// Current state
    pub state: NodeState,
    /// Index in the graph
    pub index: NodeIndex,
}

impl TaskNode {
    pub fn new(item: WorkItem, index: NodeIndex) -> Self {
        Self {
            item,
            state: NodeState::Pending,
            index,
        }
    }

    pub fn id(&self) -> &str {
        &self.item.id
    }

    pub fn output(&self) -> Option<&str> {
        match &self.state {
            NodeState::Complete { output } => Some(output),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&NodeFailure> {
        match &self.state {
            NodeState::Failed { failure } => Some(failure),
            _ => None,
        }
    }
}

/// Owns the node states of one run over a resolved graph.
#[derive(Debug)]
pub struct DagScheduler {
    /// The underlying dependency graph
    graph: DependencyGraph,
    /// Nodes with state, indexed like the graph
    nodes: Vec<TaskNode>,
    /// Completed node indices
    completed: HashSet<NodeIndex>,
    /// Failed node indices
    failed: HashSet<NodeIndex>,
}

impl DagScheduler {
    /// Create a scheduler with every node `Pending`.
    pub fn new(graph: DependencyGraph) -> Self {
        let nodes = graph
            .items()
            .iter()
            .enumerate()
            .map(|(i, item)| TaskNode::new(item.clone(), i))
            .collect();

        Self {
            graph,
            nodes,
            completed: HashSet::new(),
            failed: HashSet::new(),
        }
    }

    /// Resolve `requested` against `catalog` and wrap the result.
    pub fn resolve<S: AsRef<str>>(
        catalog: &Catalog,
        requested: &[S],
        options: ResolveOptions,
    ) -> Result<Self, CatalogError> {
        let graph = DependencyResolver::new(catalog)
            .with_options(options)
            .resolve(requested)?;
        Ok(Self::new(graph))
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get_node(&self, id: &str) -> Option<&TaskNode> {
        self.graph.get_index(id).and_then(|i| self.nodes.get(i))
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    /// Strict-wave preview of the graph.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        self.graph.compute_waves()
    }

    /// Pending nodes whose every dependency is complete, in topological order.
    pub fn ready_nodes(&self) -> Vec<&TaskNode> {
        self.nodes
            .iter()
            .filter(|node| {
                node.state.is_pending()
                    && self.graph.dependencies_satisfied(node.index, &self.completed)
            })
            .collect()
    }

    /// Ids of the ready set.
    pub fn ready_ids(&self) -> Vec<String> {
        self.ready_nodes()
            .into_iter()
            .map(|n| n.item.id.clone())
            .collect()
    }

    fn index_of(&self, id: &str, to: &'static str) -> Result<NodeIndex, InvalidTransition> {
        self.graph.get_index(id).ok_or_else(|| InvalidTransition {
            id: id.to_string(),
            from: "unknown",
            to,
        })
    }

    /// `Pending -> Running`.
    pub fn mark_running(&mut self, id: &str) -> Result<(), InvalidTransition> {
        let idx = self.index_of(id, "running")?;
        let node = &mut self.nodes[idx];
        if !node.state.is_pending() {
            return Err(InvalidTransition {
                id: id.to_string(),
                from: node.state.status().as_str(),
                to: "running",
            });
        }
        node.state = NodeState::Running {
            started_at_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
        };
        debug!(item = id, "Node running");
        Ok(())
    }

    /// `Running -> Complete`.
    pub fn mark_completed(&mut self, id: &str, output: String) -> Result<(), InvalidTransition> {
        let idx = self.index_of(id, "complete")?;
        let node = &mut self.nodes[idx];
        if !node.state.is_running() {
            return Err(InvalidTransition {
                id: id.to_string(),
                from: node.state.status().as_str(),
                to: "complete",
            });
        }
        node.state = NodeState::Complete { output };
        self.completed.insert(idx);
        debug!(item = id, "Node complete");
        Ok(())
    }

    /// `Running -> Failed` or `Pending -> Failed`.
    pub fn mark_failed(&mut self, id: &str, failure: NodeFailure) -> Result<(), InvalidTransition> {
        let idx = self.index_of(id, "failed")?;
        let node = &mut self.nodes[idx];
        if node.state.is_terminal() {
            return Err(InvalidTransition {
                id: id.to_string(),
                from: node.state.status().as_str(),
                to: "failed",
            });
        }
        debug!(item = id, failure = %failure, "Node failed");
        node.state = NodeState::Failed { failure };
        self.failed.insert(idx);
        Ok(())
    }

    /// Ids of the failed direct dependencies of a node.
    fn failed_dependencies(&self, idx: NodeIndex) -> Vec<String> {
        self.graph
            .dependencies(idx)
            .iter()
            .filter(|d| self.failed.contains(d))
            .map(|&d| self.nodes[d].item.id.clone())
            .collect()
    }

    /// Fail every pending transitive dependent of a failed node.
    ///
    /// Dependents are visited in topological order so each one names the
    /// direct dependency that took it down. Returns the ids newly failed.
    pub fn cascade_failure(&mut self, id: &str) -> Vec<String> {
        let Some(idx) = self.graph.get_index(id) else {
            return Vec::new();
        };
        if !self.failed.contains(&idx) {
            return Vec::new();
        }

        let mut skipped = Vec::new();
        for dep_idx in self.graph.transitive_dependents(idx) {
            if !self.nodes[dep_idx].state.is_pending() {
                continue;
            }
            let failure = NodeFailure::Skipped {
                failed_dependencies: self.failed_dependencies(dep_idx),
            };
            self.nodes[dep_idx].state = NodeState::Failed { failure };
            self.failed.insert(dep_idx);
            skipped.push(self.nodes[dep_idx].item.id.clone());
        }
        skipped
    }

    /// Pending nodes with at least one failed direct dependency.
    pub fn blocked_by_failure(&self) -> Vec<(String, Vec<String>)> {
        self.nodes
            .iter()
            .filter(|n| n.state.is_pending())
            .filter_map(|n| {
                let failed = self.failed_dependencies(n.index);
                (!failed.is_empty()).then(|| (n.item.id.clone(), failed))
            })
            .collect()
    }

    /// Fail every node still pending with the same reason.
    pub fn abandon_pending(&mut self, failure: NodeFailure) -> Vec<String> {
        let mut abandoned = Vec::new();
        for node in self.nodes.iter_mut().filter(|n| n.state.is_pending()) {
            node.state = NodeState::Failed {
                failure: failure.clone(),
            };
            self.failed.insert(node.index);
            abandoned.push(node.item.id.clone());
        }
        abandoned
    }

    /// Check if every node is terminal.
    pub fn all_complete(&self) -> bool {
        self.nodes.iter().all(|n| n.state.is_terminal())
    }

    /// Check if every node completed.
    pub fn all_success(&self) -> bool {
        self.nodes.iter().all(|n| n.state.is_success())
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn terminal_count(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    pub fn pending_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.state.is_pending()).count()
    }

    pub fn running_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.state.is_running()).count()
    }

    /// Get completion percentage.
    pub fn completion_percentage(&self) -> f64 {
        if self.nodes.is_empty() {
            return 100.0;
        }
        (self.terminal_count() as f64 / self.nodes.len() as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(items: &[(&str, &[&str])]) -> DagScheduler {
        let catalog = Catalog::new(items.iter().map(|(id, deps)| WorkItem::new(id, deps)).collect())
            .unwrap();
        let ids: Vec<&str> = items.iter().map(|(id, _)| *id).collect();
        DagScheduler::resolve(&catalog, &ids, ResolveOptions::default()).unwrap()
    }

    fn diamond() -> DagScheduler {
        scheduler(&[("A", &[]), ("B", &["A"]), ("C", &["A"]), ("D", &["B", "C"])])
    }

    fn exec_failure() -> NodeFailure {
        NodeFailure::ExecutionFailed {
            attempts: 1,
            cause: "boom".into(),
        }
    }

    #[test]
    fn test_ready_set_progression() {
        let mut sched = diamond();
        assert_eq!(sched.ready_ids(), vec!["A"]);

        sched.mark_running("A").unwrap();
        assert!(sched.ready_ids().is_empty());

        sched.mark_completed("A", "a".into()).unwrap();
        assert_eq!(sched.ready_ids(), vec!["B", "C"]);

        sched.mark_running("B").unwrap();
        sched.mark_completed("B", "b".into()).unwrap();
        // D still waits on C
        assert_eq!(sched.ready_ids(), vec!["C"]);
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let mut sched = diamond();

        assert!(sched.mark_completed("A", "a".into()).is_err());
        sched.mark_running("A").unwrap();
        assert!(sched.mark_running("A").is_err());
        sched.mark_completed("A", "a".into()).unwrap();
        assert!(sched.mark_failed("A", exec_failure()).is_err());

        let err = sched.mark_running("A").unwrap_err();
        assert_eq!(err.from, "complete");
        assert!(sched.mark_running("missing").is_err());
    }

    #[test]
    fn test_output_and_failure_follow_state() {
        let mut sched = diamond();
        sched.mark_running("A").unwrap();
        assert!(sched.get_node("A").unwrap().output().is_none());
        sched.mark_completed("A", "text".into()).unwrap();
        let a = sched.get_node("A").unwrap();
        assert_eq!(a.output(), Some("text"));
        assert!(a.failure().is_none());
    }

    #[test]
    fn test_cascade_marks_transitive_dependents() {
        let mut sched = scheduler(&[("A", &[]), ("B", &["A"]), ("C", &["B"])]);
        sched.mark_running("A").unwrap();
        sched.mark_failed("A", exec_failure()).unwrap();

        let skipped = sched.cascade_failure("A");
        assert_eq!(skipped, vec!["B", "C"]);
        assert_eq!(
            sched.get_node("B").unwrap().failure(),
            Some(&NodeFailure::Skipped {
                failed_dependencies: vec!["A".into()]
            })
        );
        assert_eq!(
            sched.get_node("C").unwrap().failure(),
            Some(&NodeFailure::Skipped {
                failed_dependencies: vec!["B".into()]
            })
        );
        assert!(sched.all_complete());
        assert!(!sched.all_success());
    }

    #[test]
    fn test_cascade_leaves_independent_branch_alone() {
        let mut sched = diamond();
        sched.mark_running("A").unwrap();
        sched.mark_completed("A", "a".into()).unwrap();
        sched.mark_running("B").unwrap();
        sched.mark_running("C").unwrap();
        sched.mark_failed("B", exec_failure()).unwrap();

        assert_eq!(sched.cascade_failure("B"), vec!["D"]);
        assert!(sched.get_node("C").unwrap().state.is_running());
        assert_eq!(
            sched.get_node("D").unwrap().failure(),
            Some(&NodeFailure::Skipped {
                failed_dependencies: vec!["B".into()]
            })
        );
    }

    #[test]
    fn test_cascade_on_non_failed_node_is_noop() {
        let mut sched = diamond();
        assert!(sched.cascade_failure("A").is_empty());
        assert!(sched.cascade_failure("nope").is_empty());
    }

    #[test]
    fn test_blocked_by_failure_and_abandon() {
        let mut sched = diamond();
        sched.mark_running("A").unwrap();
        sched.mark_failed("A", exec_failure()).unwrap();

        let blocked = sched.blocked_by_failure();
        assert_eq!(blocked.len(), 2);
        assert_eq!(blocked[0], ("B".to_string(), vec!["A".to_string()]));

        let abandoned = sched.abandon_pending(NodeFailure::Cancelled);
        assert_eq!(abandoned, vec!["B", "C", "D"]);
        assert_eq!(sched.pending_count(), 0);
        assert_eq!(sched.failed_count(), 4);
    }

    #[test]
    fn test_completion_tracking() {
        let mut sched = scheduler(&[("01", &[]), ("02", &["01"])]);
        assert_eq!(sched.completion_percentage(), 0.0);

        sched.mark_running("01").unwrap();
        assert_eq!(sched.running_count(), 1);
        sched.mark_completed("01", String::new()).unwrap();
        assert_eq!(sched.completion_percentage(), 50.0);

        sched.mark_running("02").unwrap();
        sched.mark_completed("02", String::new()).unwrap();
        assert_eq!(sched.completion_percentage(), 100.0);
        assert!(sched.all_success());
        assert_eq!(sched.completed_count(), 2);
    }
}
