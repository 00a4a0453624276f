//! Dependency-aware scheduling of work items.
//!
//! ## Architecture
//!
//! The DAG layer has four parts:
//!
//! 1. **Resolver** - validates a requested subset of the catalog, detects
//!    cycles and produces a stable topological order
//! 2. **Scheduler** - owns per-node state, computes the ready set and
//!    cascades failures to dependents
//! 3. **Executor** - runs ready nodes on a bounded pool through the rate
//!    limiter and retry coordinator, emitting a progress event per transition
//! 4. **State** - per-item results and the run summary
//!
//! ## Example
//!
//! ```no_run
//! use docflow::catalog::{Catalog, WorkItem};
//! use docflow::dag::DependencyResolver;
//!
//! # fn example() -> Result<(), docflow::errors::CatalogError> {
//! let catalog = Catalog::new(vec![
//!     WorkItem::new("outline", &[]),
//!     WorkItem::new("intro", &["outline"]),
//!     WorkItem::new("body", &["outline"]),
//!     WorkItem::new("summary", &["intro", "body"]),
//! ])?;
//!
//! let graph = DependencyResolver::new(&catalog).resolve(&["summary"])?;
//! // Wave 0: [outline]
//! // Wave 1: [intro, body]
//! // Wave 2: [summary]
//! let waves = graph.compute_waves();
//! # Ok(())
//! # }
//! ```

mod executor;
mod resolver;
mod scheduler;
pub(crate) mod state;

pub use executor::{DagExecutor, ExecutionReport, ItemExecutor};
pub use resolver::{DependencyGraph, DependencyResolver, NodeIndex, ResolveOptions, SkippedDependency};
pub use scheduler::{DagScheduler, NodeState, NodeStatus, TaskNode};
pub use state::{ExecutionTimer, FailedItem, ItemResult, RunState, RunSummary};
