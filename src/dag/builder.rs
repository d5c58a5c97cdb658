use std::sync::Arc;

use super::graph::Dag;
use super::task::{DagTask, TaskResult};
use crate::error::{Error, Result};

/// Fluent graph construction.
///
/// ```no_run
/// use filament::dag::{DagBuilder, TaskResult};
///
/// let dag = DagBuilder::new("pipeline")
///     .add_task("fetch", TaskResult::ok)
///     .add_task("parse", TaskResult::ok)
///     .depend_on("fetch", "parse")
///     .build()
///     .expect("acyclic");
/// ```
pub struct DagBuilder {
    dag: Arc<Dag>,
    error: Option<Error>,
}

impl DagBuilder {
    pub fn new(name: &str) -> DagBuilder {
        DagBuilder {
            dag: Dag::new(name),
            error: None,
        }
    }

    pub fn add_task(
        mut self,
        name: &str,
        body: impl Fn() -> TaskResult + Send + Sync + 'static,
    ) -> DagBuilder {
        if self.error.is_none() && !self.dag.add_task(DagTask::new(name, body)) {
            self.error = Some(Error::InvalidState("duplicate task name"));
        }
        self
    }

    pub fn depend_on(mut self, predecessor: &str, successor: &str) -> DagBuilder {
        if self.error.is_some() {
            return self;
        }
        let (pred, succ) = match (self.dag.get_task(predecessor), self.dag.get_task(successor)) {
            (Some(pred), Some(succ)) => (pred, succ),
            _ => {
                self.error = Some(Error::InvalidState("dependency on an unknown task"));
                return self;
            }
        };
        if succ.has_predecessor(&pred) {
            self.error = Some(Error::InvalidState("duplicate dependency"));
            return self;
        }
        if !self.dag.add_dependency(predecessor, successor) {
            self.error = Some(Error::Cycle);
        }
        self
    }

    /// The finished graph, or the first construction error. A rejected
    /// edge surfaces as [`Error::Cycle`].
    pub fn build(self) -> Result<Arc<Dag>> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.dag.has_cycle() {
            return Err(Error::Cycle);
        }
        Ok(self.dag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_valid_graph() {
        let dag = DagBuilder::new("ok")
            .add_task("a", TaskResult::ok)
            .add_task("b", TaskResult::ok)
            .depend_on("a", "b")
            .build()
            .unwrap();
        assert_eq!(dag.task_count(), 2);
    }

    #[test]
    fn cyclic_definitions_surface_as_cycle() {
        let result = DagBuilder::new("cyclic")
            .add_task("a", TaskResult::ok)
            .add_task("b", TaskResult::ok)
            .depend_on("a", "b")
            .depend_on("b", "a")
            .build();
        match result {
            Err(Error::Cycle) => {}
            other => panic!("expected Cycle, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn unknown_names_are_invalid() {
        let result = DagBuilder::new("bad-edge")
            .add_task("a", TaskResult::ok)
            .depend_on("a", "ghost")
            .build();
        match result {
            Err(Error::InvalidState(_)) => {}
            other => panic!("expected InvalidState, got {:?}", other.map(|_| ())),
        }
    }
}
