//! Task-graph execution against a real worker pool.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use filament::dag::{Dag, DagBuilder, DagExecutor, DagTask, TaskResult, TaskState};
use filament::reactor::IoManager;

fn counting_task(name: &str, hits: &Arc<AtomicUsize>) -> Arc<DagTask> {
    let hits = hits.clone();
    DagTask::new(name, move || {
        hits.fetch_add(1, Ordering::SeqCst);
        TaskResult::ok()
    })
}

#[test]
fn rejected_cycle_leaves_the_graph_runnable() {
    let hits = Arc::new(AtomicUsize::new(0));
    let dag = Dag::new("abc");
    for name in &["A", "B", "C"] {
        assert!(dag.add_task(counting_task(name, &hits)));
    }
    assert!(dag.add_dependency("A", "B"));
    assert!(dag.add_dependency("B", "C"));
    assert!(!dag.add_dependency("C", "A"), "C->A must be refused");
    assert!(!dag.has_cycle());

    let worker = IoManager::new(2, false, "dag-cycle").unwrap();
    let executor = DagExecutor::new(Some(worker.clone())).unwrap();
    executor.set_dag(dag);
    assert!(executor.start());
    assert!(executor.wait_for_completion(Some(Duration::from_secs(5))));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(executor.completed_task_count(), 3);
    worker.stop().unwrap();
}

#[test]
fn failure_gates_downstream_but_not_siblings() {
    // T1 -> T3, T2 -> T3, T3 -> T4; T2 fails.
    let dag = Dag::new("failure-isolation");
    let ran = Arc::new(Mutex::new(Vec::new()));
    for name in &["T1", "T3", "T4"] {
        let ran = ran.clone();
        let tag = name.to_string();
        dag.add_task(DagTask::new(name, move || {
            ran.lock().unwrap().push(tag.clone());
            TaskResult::ok()
        }));
    }
    dag.add_task(DagTask::new("T2", || TaskResult::fail("deliberate")));
    assert!(dag.add_dependency("T1", "T3"));
    assert!(dag.add_dependency("T2", "T3"));
    assert!(dag.add_dependency("T3", "T4"));

    let worker = IoManager::new(2, false, "dag-failure").unwrap();
    let executor = DagExecutor::new(Some(worker.clone())).unwrap();
    executor.set_dag(dag.clone());
    assert!(executor.start());
    assert!(
        !executor.wait_for_completion(Some(Duration::from_secs(5))),
        "a failed run must not report success"
    );
    assert!(executor.is_failed());
    assert_eq!(executor.completed_task_count(), 1, "only T1 completes");
    assert_eq!(executor.failed_task_count(), 1);
    assert_eq!(*ran.lock().unwrap(), vec!["T1".to_string()]);
    assert_eq!(dag.get_task("T3").unwrap().state(), TaskState::Ready);
    assert_eq!(dag.get_task("T4").unwrap().state(), TaskState::Ready);
    let failed = dag.get_task("T2").unwrap();
    assert_eq!(failed.state(), TaskState::Failed);
    match failed.failure() {
        Some(filament::error::Error::TaskFailed(msg)) => assert_eq!(msg, "deliberate"),
        other => panic!("expected TaskFailed, got {:?}", other),
    }
    worker.stop().unwrap();
}

#[test]
fn diamond_runs_in_dependency_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let task = |name: &str| {
        let order = order.clone();
        let tag = name.to_string();
        move || {
            order.lock().unwrap().push(tag.clone());
            TaskResult::ok()
        }
    };
    let dag = DagBuilder::new("diamond")
        .add_task("root", task("root"))
        .add_task("left", task("left"))
        .add_task("right", task("right"))
        .add_task("sink", task("sink"))
        .depend_on("root", "left")
        .depend_on("root", "right")
        .depend_on("left", "sink")
        .depend_on("right", "sink")
        .build()
        .unwrap();

    let worker = IoManager::new(2, false, "dag-diamond").unwrap();
    let executor = DagExecutor::new(Some(worker.clone())).unwrap();
    executor.set_dag(dag);
    assert!(executor.start());
    assert!(executor.wait_for_completion(Some(Duration::from_secs(5))));

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 4);
    let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
    assert_eq!(pos("root"), 0);
    assert_eq!(pos("sink"), 3);
    worker.stop().unwrap();
}

#[test]
fn task_results_carry_data() {
    let dag = Dag::new("data");
    dag.add_task(DagTask::new("produce", || TaskResult::with_data("payload".to_string())));
    let worker = IoManager::new(1, false, "dag-data").unwrap();
    let executor = DagExecutor::new(Some(worker.clone())).unwrap();
    executor.set_dag(dag.clone());
    assert!(executor.start());
    assert!(executor.wait_for_completion(Some(Duration::from_secs(5))));

    let result = dag.get_task("produce").unwrap().result();
    assert!(result.success);
    let data = result.data.unwrap();
    assert_eq!(data.downcast_ref::<String>().unwrap(), "payload");
    worker.stop().unwrap();
}

#[test]
fn pause_gates_pending_tasks() {
    let dag = Dag::new("pausable");
    let hits = Arc::new(AtomicUsize::new(0));
    for name in &["first", "second", "third"] {
        let hits = hits.clone();
        dag.add_task(DagTask::new(name, move || {
            std::thread::sleep(Duration::from_millis(30));
            hits.fetch_add(1, Ordering::SeqCst);
            TaskResult::ok()
        }));
    }
    dag.add_dependency("first", "second");
    dag.add_dependency("second", "third");

    let worker = IoManager::new(2, false, "dag-pause").unwrap();
    let executor = DagExecutor::new(Some(worker.clone())).unwrap();
    executor.set_dag(dag);
    assert!(executor.start());
    executor.pause();
    assert!(
        !executor.wait_for_completion(Some(Duration::from_millis(200))),
        "paused run must not complete"
    );
    executor.resume();
    assert!(executor.wait_for_completion(Some(Duration::from_secs(5))));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    worker.stop().unwrap();
}

#[test]
fn executor_can_rerun_after_completion() {
    let hits = Arc::new(AtomicUsize::new(0));
    let dag = Dag::new("rerun");
    dag.add_task(counting_task("only", &hits));

    let worker = IoManager::new(1, false, "dag-rerun").unwrap();
    let executor = DagExecutor::new(Some(worker.clone())).unwrap();
    executor.set_dag(dag);
    assert!(executor.start());
    assert!(executor.wait_for_completion(Some(Duration::from_secs(5))));
    assert!(executor.start(), "terminal executor restarts after reset");
    assert!(executor.wait_for_completion(Some(Duration::from_secs(5))));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    worker.stop().unwrap();
}
