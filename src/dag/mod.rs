//! Dependency-graph task execution.
//!
//! [`Dag`] holds name-addressed tasks and their dependency edges,
//! rejecting any edge that would close a cycle. [`DagExecutor`] drives a
//! graph over an [`IoManager`](crate::reactor::IoManager): entry tasks go
//! to the worker pool immediately, every other task is dispatched once
//! its completed-predecessor counter reaches its predecessor count.
//! A failed task quarantines its downstream subgraph but independent
//! branches keep running.
pub mod builder;
pub mod executor;
pub mod graph;
pub mod task;

pub use builder::DagBuilder;
pub use executor::{DagExecutor, ExecutorState};
pub use graph::Dag;
pub use task::{DagTask, TaskResult, TaskState};
