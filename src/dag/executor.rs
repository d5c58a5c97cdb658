use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{info, warn};

use super::graph::Dag;
use super::task::{DagTask, TaskState};
use crate::error::Result;
use crate::reactor::IoManager;
use crate::scheduler::Task;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle = 0,
    Running = 1,
    Paused = 2,
    Completed = 3,
    Failed = 4,
    Stopped = 5,
}

impl ExecutorState {
    fn from_u8(v: u8) -> ExecutorState {
        match v {
            0 => ExecutorState::Idle,
            1 => ExecutorState::Running,
            2 => ExecutorState::Paused,
            3 => ExecutorState::Completed,
            4 => ExecutorState::Failed,
            _ => ExecutorState::Stopped,
        }
    }
}

/// Drives a [`Dag`] over an [`IoManager`] worker pool.
///
/// Entry tasks are submitted on [`start`](Self::start); every completed
/// task submits whichever successors just became unblocked. The terminal
/// state is `Completed` when every task finished, `Failed` as soon as the
/// graph can make no more progress with at least one failure: tasks
/// downstream of a failure stay `Ready` forever and are accounted as
/// unreachable rather than waited for.
pub struct DagExecutor {
    weak_self: Weak<DagExecutor>,
    dag: Mutex<Option<Arc<Dag>>>,
    worker: Arc<IoManager>,
    own_worker: bool,
    state: AtomicU8,
    completed_tasks: AtomicUsize,
    failed_tasks: AtomicUsize,
    unreachable_tasks: AtomicUsize,
    gate: Mutex<()>,
    gate_cv: Condvar,
}

impl DagExecutor {
    /// With `worker = None` the executor owns a single-threaded reactor
    /// of its own.
    pub fn new(worker: Option<Arc<IoManager>>) -> Result<Arc<DagExecutor>> {
        let (worker, own_worker) = match worker {
            Some(worker) => (worker, false),
            None => (IoManager::new(1, false, "dag-executor")?, true),
        };
        Ok(Arc::new_cyclic(|weak| DagExecutor {
            weak_self: weak.clone(),
            dag: Mutex::new(None),
            worker,
            own_worker,
            state: AtomicU8::new(ExecutorState::Idle as u8),
            completed_tasks: AtomicUsize::new(0),
            failed_tasks: AtomicUsize::new(0),
            unreachable_tasks: AtomicUsize::new(0),
            gate: Mutex::new(()),
            gate_cv: Condvar::new(),
        }))
    }

    pub fn set_dag(&self, dag: Arc<Dag>) {
        if self.is_running() {
            warn!("dag executor: cannot swap the graph while running");
            return;
        }
        *self.dag.lock().unwrap() = Some(dag);
        self.reset();
    }

    pub fn dag(&self) -> Option<Arc<Dag>> {
        self.dag.lock().unwrap().clone()
    }

    pub fn worker(&self) -> &Arc<IoManager> {
        &self.worker
    }

    pub fn state(&self) -> ExecutorState {
        ExecutorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn completed_task_count(&self) -> usize {
        self.completed_tasks.load(Ordering::SeqCst)
    }

    pub fn failed_task_count(&self) -> usize {
        self.failed_tasks.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ExecutorState::Running
    }

    pub fn is_paused(&self) -> bool {
        self.state() == ExecutorState::Paused
    }

    pub fn is_completed(&self) -> bool {
        self.state() == ExecutorState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state() == ExecutorState::Failed
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ExecutorState::Stopped
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state(),
            ExecutorState::Completed | ExecutorState::Failed | ExecutorState::Stopped
        )
    }

    /// Submit every entry task. False for an empty or cyclic graph.
    pub fn start(&self) -> bool {
        let dag = match self.dag() {
            Some(dag) if !dag.is_empty() => dag,
            _ => {
                warn!("dag executor: nothing to start");
                return false;
            }
        };
        if dag.has_cycle() {
            warn!("dag executor: graph has a cycle");
            return false;
        }
        if self.is_running() {
            warn!("dag executor: already running");
            return true;
        }
        if self.is_terminal() {
            self.reset();
        }
        self.set_state(ExecutorState::Running);
        for task in dag.entry_tasks() {
            self.submit(&task);
        }
        true
    }

    pub fn pause(&self) {
        if self.is_running() {
            self.set_state(ExecutorState::Paused);
            info!("dag executor paused");
        }
    }

    pub fn resume(&self) {
        if self.is_paused() {
            self.set_state(ExecutorState::Running);
            info!("dag executor resumed");
            let _gate = self.gate.lock().unwrap();
            self.gate_cv.notify_all();
        }
    }

    pub fn stop(&self) {
        if !self.is_completed() && !self.is_stopped() {
            self.set_state(ExecutorState::Stopped);
            info!("dag executor stopped");
            let _gate = self.gate.lock().unwrap();
            self.gate_cv.notify_all();
        }
    }

    /// Block until the run reaches a terminal state. Returns whether it
    /// completed successfully; `None` waits forever.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        let mut gate = self.gate.lock().unwrap();
        match timeout {
            None => {
                while !self.is_terminal() {
                    gate = self.gate_cv.wait(gate).unwrap();
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !self.is_terminal() {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (next, wait) = self.gate_cv.wait_timeout(gate, deadline - now).unwrap();
                    gate = next;
                    if wait.timed_out() && !self.is_terminal() {
                        return false;
                    }
                }
            }
        }
        self.is_completed()
    }

    fn submit(&self, task: &Arc<DagTask>) {
        if self.is_stopped() || !task.all_predecessors_completed() {
            return;
        }
        let executor = match self.weak_self.upgrade() {
            Some(ex) => ex,
            None => return,
        };
        let task = task.clone();
        let wrapped = move || {
            if executor.is_paused() {
                let mut gate = executor.gate.lock().unwrap();
                while executor.is_paused() && !executor.is_stopped() {
                    gate = executor.gate_cv.wait(gate).unwrap();
                }
            }
            if executor.is_stopped() {
                return;
            }
            task.run();
            executor.on_task_done(&task);
        };
        if let Err(e) = self.worker.schedule(Task::call(wrapped)) {
            warn!("dag executor: submit failed: {}", e);
        }
    }

    fn on_task_done(&self, task: &Arc<DagTask>) {
        match task.state() {
            TaskState::Finished => {
                self.completed_tasks.fetch_add(1, Ordering::SeqCst);
            }
            TaskState::Failed => {
                self.failed_tasks.fetch_add(1, Ordering::SeqCst);
                warn!("task {} failed: {}", task.name(), task.result().error_msg);
                self.quarantine_downstream(task);
            }
            _ => {}
        }
        for successor in task.successors() {
            if successor.all_predecessors_completed() {
                self.submit(&successor);
            }
        }
        self.check_completion();
    }

    /// Everything transitively downstream of a failed task can never
    /// satisfy its dependency counter; count it as unreachable so the run
    /// can terminate. The tasks themselves stay Ready; failure does not
    /// cancel independent subgraphs.
    fn quarantine_downstream(&self, task: &Arc<DagTask>) {
        for successor in task.successors() {
            if successor.mark_doomed() {
                self.unreachable_tasks.fetch_add(1, Ordering::SeqCst);
                self.quarantine_downstream(&successor);
            }
        }
    }

    fn check_completion(&self) {
        if self.is_terminal() {
            return;
        }
        let total = match self.dag() {
            Some(dag) => dag.task_count(),
            None => return,
        };
        let settled = self.completed_tasks.load(Ordering::SeqCst)
            + self.failed_tasks.load(Ordering::SeqCst)
            + self.unreachable_tasks.load(Ordering::SeqCst);
        if settled >= total {
            let failed = self.failed_tasks.load(Ordering::SeqCst) > 0;
            self.set_state(if failed {
                ExecutorState::Failed
            } else {
                ExecutorState::Completed
            });
            let _gate = self.gate.lock().unwrap();
            self.gate_cv.notify_all();
        }
    }

    fn reset(&self) {
        self.completed_tasks.store(0, Ordering::SeqCst);
        self.failed_tasks.store(0, Ordering::SeqCst);
        self.unreachable_tasks.store(0, Ordering::SeqCst);
        self.set_state(ExecutorState::Idle);
        if let Some(dag) = self.dag() {
            for task in dag.tasks() {
                task.reset_runtime();
            }
        }
    }

    fn set_state(&self, state: ExecutorState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for DagExecutor {
    fn drop(&mut self) {
        self.stop();
        if self.own_worker {
            if let Err(e) = self.worker.stop() {
                warn!("dag executor: worker stop: {}", e);
            }
        }
    }
}
