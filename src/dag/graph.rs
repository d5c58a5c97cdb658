use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::task::{self, DagTask};

struct GraphInner {
    tasks: Vec<Arc<DagTask>>,
    by_name: HashMap<String, Arc<DagTask>>,
}

/// Name-addressed task graph. Dependency insertion keeps the graph
/// acyclic: an edge that would close a cycle is rolled back and refused.
pub struct Dag {
    name: String,
    inner: Mutex<GraphInner>,
}

impl Dag {
    pub fn new(name: &str) -> Arc<Dag> {
        Arc::new(Dag {
            name: name.to_string(),
            inner: Mutex::new(GraphInner {
                tasks: Vec::new(),
                by_name: HashMap::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False when a task with the same name already exists.
    pub fn add_task(&self, task: Arc<DagTask>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.by_name.contains_key(task.name()) {
            return false;
        }
        inner.by_name.insert(task.name().to_string(), task.clone());
        inner.tasks.push(task);
        true
    }

    /// Drop a task and every edge touching it.
    pub fn remove_task(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let task = match inner.by_name.remove(name) {
            Some(task) => task,
            None => return false,
        };
        for other in &inner.tasks {
            if !Arc::ptr_eq(other, &task) {
                task::unlink(other, &task);
                task::unlink(&task, other);
            }
        }
        inner.tasks.retain(|t| !Arc::ptr_eq(t, &task));
        true
    }

    pub fn get_task(&self, name: &str) -> Option<Arc<DagTask>> {
        self.inner.lock().unwrap().by_name.get(name).cloned()
    }

    pub fn tasks(&self) -> Vec<Arc<DagTask>> {
        self.inner.lock().unwrap().tasks.clone()
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }

    /// Add `predecessor -> successor`. Refuses unknown names, self
    /// edges, duplicates, and edges that would create a cycle.
    pub fn add_dependency(&self, predecessor: &str, successor: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        let pred = match inner.by_name.get(predecessor) {
            Some(t) => t.clone(),
            None => return false,
        };
        let succ = match inner.by_name.get(successor) {
            Some(t) => t.clone(),
            None => return false,
        };
        if Arc::ptr_eq(&pred, &succ) {
            return false;
        }
        if succ.has_predecessor(&pred) {
            return false;
        }
        task::link(&pred, &succ);
        if has_cycle_in(&inner.tasks) {
            task::unlink(&pred, &succ);
            return false;
        }
        true
    }

    pub fn remove_dependency(&self, predecessor: &str, successor: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        let (pred, succ) = match (
            inner.by_name.get(predecessor),
            inner.by_name.get(successor),
        ) {
            (Some(p), Some(s)) => (p.clone(), s.clone()),
            _ => return false,
        };
        task::unlink(&pred, &succ)
    }

    pub fn has_cycle(&self) -> bool {
        has_cycle_in(&self.inner.lock().unwrap().tasks)
    }

    /// Tasks with no predecessors.
    pub fn entry_tasks(&self) -> Vec<Arc<DagTask>> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .iter()
            .filter(|t| t.predecessor_count() == 0)
            .cloned()
            .collect()
    }

    /// Tasks with no successors.
    pub fn exit_tasks(&self) -> Vec<Arc<DagTask>> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .iter()
            .filter(|t| t.successors().is_empty())
            .cloned()
            .collect()
    }

    /// Tasks in an order where every predecessor precedes its successors.
    pub fn topological_sort(&self) -> Vec<Arc<DagTask>> {
        let tasks = self.inner.lock().unwrap().tasks.clone();
        let mut visited = HashMap::new();
        let mut reversed = Vec::with_capacity(tasks.len());
        for task in &tasks {
            topo_visit(task, &mut visited, &mut reversed);
        }
        reversed.reverse();
        reversed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        for task in &inner.tasks {
            for successor in task.successors() {
                task::unlink(task, &successor);
            }
        }
        inner.tasks.clear();
        inner.by_name.clear();
    }
}

fn topo_visit(
    task: &Arc<DagTask>,
    visited: &mut HashMap<String, bool>,
    out: &mut Vec<Arc<DagTask>>,
) {
    if visited.insert(task.name().to_string(), true).is_some() {
        return;
    }
    for successor in task.successors() {
        topo_visit(&successor, visited, out);
    }
    out.push(task.clone());
}

fn has_cycle_in(tasks: &[Arc<DagTask>]) -> bool {
    let mut visited = HashMap::new();
    let mut on_stack = HashMap::new();
    for task in tasks {
        if !visited.get(task.name()).copied().unwrap_or(false)
            && cycle_visit(task, &mut visited, &mut on_stack)
        {
            return true;
        }
    }
    false
}

fn cycle_visit(
    task: &Arc<DagTask>,
    visited: &mut HashMap<String, bool>,
    on_stack: &mut HashMap<String, bool>,
) -> bool {
    visited.insert(task.name().to_string(), true);
    on_stack.insert(task.name().to_string(), true);
    for successor in task.successors() {
        if !visited.get(successor.name()).copied().unwrap_or(false) {
            if cycle_visit(&successor, visited, on_stack) {
                return true;
            }
        } else if on_stack.get(successor.name()).copied().unwrap_or(false) {
            return true;
        }
    }
    on_stack.insert(task.name().to_string(), false);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::task::TaskResult;

    fn noop(name: &str) -> Arc<DagTask> {
        DagTask::new(name, TaskResult::ok)
    }

    fn chain_of_three() -> Arc<Dag> {
        let dag = Dag::new("chain");
        for name in &["a", "b", "c"] {
            assert!(dag.add_task(noop(name)));
        }
        assert!(dag.add_dependency("a", "b"));
        assert!(dag.add_dependency("b", "c"));
        dag
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let dag = Dag::new("dup");
        assert!(dag.add_task(noop("a")));
        assert!(!dag.add_task(noop("a")));
    }

    #[test]
    fn closing_edge_is_rolled_back() {
        let dag = chain_of_three();
        assert!(!dag.add_dependency("c", "a"), "c->a closes a cycle");
        assert!(!dag.has_cycle(), "rejected edge must leave no trace");
        // The rollback kept the graph usable.
        assert_eq!(dag.get_task("a").unwrap().successors().len(), 1);
        assert_eq!(dag.entry_tasks().len(), 1);
    }

    #[test]
    fn self_and_duplicate_edges_are_rejected() {
        let dag = chain_of_three();
        assert!(!dag.add_dependency("a", "a"));
        assert!(!dag.add_dependency("a", "b"));
        assert!(!dag.add_dependency("missing", "b"));
    }

    #[test]
    fn topological_sort_respects_edges() {
        let dag = Dag::new("diamond");
        for name in &["root", "left", "right", "sink"] {
            dag.add_task(noop(name));
        }
        dag.add_dependency("root", "left");
        dag.add_dependency("root", "right");
        dag.add_dependency("left", "sink");
        dag.add_dependency("right", "sink");

        let order: Vec<String> = dag
            .topological_sort()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("root") < pos("left"));
        assert!(pos("root") < pos("right"));
        assert!(pos("left") < pos("sink"));
        assert!(pos("right") < pos("sink"));
    }

    #[test]
    fn remove_task_drops_edges() {
        let dag = chain_of_three();
        assert!(dag.remove_task("b"));
        assert_eq!(dag.task_count(), 2);
        assert!(dag.get_task("a").unwrap().successors().is_empty());
        assert_eq!(dag.get_task("c").unwrap().predecessor_count(), 0);
        assert!(!dag.remove_task("b"));
    }

    #[test]
    fn entry_and_exit_queries() {
        let dag = chain_of_three();
        let entries: Vec<_> = dag.entry_tasks().iter().map(|t| t.name().to_string()).collect();
        let exits: Vec<_> = dag.exit_tasks().iter().map(|t| t.name().to_string()).collect();
        assert_eq!(entries, vec!["a"]);
        assert_eq!(exits, vec!["c"]);
    }
}
