use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use log::{error, warn};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready = 0,
    Running = 1,
    Finished = 2,
    Failed = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> TaskState {
        match v {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            2 => TaskState::Finished,
            _ => TaskState::Failed,
        }
    }
}

/// Outcome recorded by a task body.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct TaskResult {
    pub success: bool,
    pub error_msg: String,
    #[derivative(Debug = "ignore")]
    pub data: Option<Arc<dyn Any + Send + Sync>>,
}

impl TaskResult {
    pub fn ok() -> TaskResult {
        TaskResult {
            success: true,
            error_msg: String::new(),
            data: None,
        }
    }

    pub fn with_data(data: impl Any + Send + Sync) -> TaskResult {
        TaskResult {
            success: true,
            error_msg: String::new(),
            data: Some(Arc::new(data)),
        }
    }

    pub fn fail(msg: impl Into<String>) -> TaskResult {
        TaskResult {
            success: false,
            error_msg: msg.into(),
            data: None,
        }
    }
}

pub type TaskBody = Arc<dyn Fn() -> TaskResult + Send + Sync>;

/// A named unit of work inside a [`Dag`](crate::dag::Dag).
///
/// Successor edges own their targets; predecessor back-edges are weak,
/// the graph keeps every task alive.
pub struct DagTask {
    name: String,
    state: AtomicU8,
    body: TaskBody,
    result: Mutex<TaskResult>,
    predecessors: Mutex<Vec<Weak<DagTask>>>,
    successors: Mutex<Vec<Arc<DagTask>>>,
    completed_predecessors: AtomicUsize,
    doomed: AtomicBool,
    done: Mutex<bool>,
    done_cv: Condvar,
}

impl DagTask {
    pub fn new(name: &str, body: impl Fn() -> TaskResult + Send + Sync + 'static) -> Arc<DagTask> {
        Arc::new(DagTask {
            name: name.to_string(),
            state: AtomicU8::new(TaskState::Ready as u8),
            body: Arc::new(body),
            result: Mutex::new(TaskResult::ok()),
            predecessors: Mutex::new(Vec::new()),
            successors: Mutex::new(Vec::new()),
            completed_predecessors: AtomicUsize::new(0),
            doomed: AtomicBool::new(false),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn result(&self) -> TaskResult {
        self.result.lock().unwrap().clone()
    }

    pub fn predecessor_count(&self) -> usize {
        self.predecessors.lock().unwrap().len()
    }

    pub fn completed_predecessor_count(&self) -> usize {
        self.completed_predecessors.load(Ordering::SeqCst)
    }

    pub fn all_predecessors_completed(&self) -> bool {
        self.completed_predecessor_count() == self.predecessor_count()
    }

    pub(crate) fn successors(&self) -> Vec<Arc<DagTask>> {
        self.successors.lock().unwrap().clone()
    }

    pub(crate) fn has_predecessor(&self, pred: &Arc<DagTask>) -> bool {
        self.predecessors
            .lock()
            .unwrap()
            .iter()
            .any(|w| w.upgrade().map_or(false, |p| Arc::ptr_eq(&p, pred)))
    }

    pub(crate) fn mark_doomed(&self) -> bool {
        !self.doomed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn reset_runtime(&self) {
        self.state.store(TaskState::Ready as u8, Ordering::Release);
        self.completed_predecessors.store(0, Ordering::SeqCst);
        self.doomed.store(false, Ordering::SeqCst);
        *self.result.lock().unwrap() = TaskResult::ok();
        *self.done.lock().unwrap() = false;
    }

    /// The captured failure as a crate error, if the task failed.
    pub fn failure(&self) -> Option<crate::error::Error> {
        if self.state() == TaskState::Failed {
            Some(crate::error::Error::TaskFailed(self.result().error_msg))
        } else {
            None
        }
    }

    /// Block the calling thread until this task finished or failed.
    pub fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.done_cv.wait(done).unwrap();
        }
    }

    /// Execute the body, capturing panics into the result record. Only a
    /// successful run advances the successors' dependency counters; a
    /// failure leaves its downstream permanently gated.
    pub(crate) fn run(&self) {
        if !self.all_predecessors_completed() {
            warn!("task {}: run with incomplete predecessors", self.name);
            *self.result.lock().unwrap() = TaskResult::fail("predecessors incomplete");
            self.state.store(TaskState::Failed as u8, Ordering::Release);
            self.notify_done();
            return;
        }
        self.state.store(TaskState::Running as u8, Ordering::Release);

        let body = self.body.clone();
        let outcome = match panic::catch_unwind(AssertUnwindSafe(move || body())) {
            Ok(result) => result,
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "task panicked".to_string()
                };
                error!("task {}: panicked: {}", self.name, msg);
                TaskResult::fail(msg)
            }
        };

        let success = outcome.success;
        *self.result.lock().unwrap() = outcome;
        self.state.store(
            if success {
                TaskState::Finished as u8
            } else {
                TaskState::Failed as u8
            },
            Ordering::Release,
        );
        self.notify_done();

        if success {
            for successor in self.successors() {
                successor
                    .completed_predecessors
                    .fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn notify_done(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.done_cv.notify_all();
    }
}

/// Wire `pred -> succ`.
pub(crate) fn link(pred: &Arc<DagTask>, succ: &Arc<DagTask>) {
    succ.predecessors.lock().unwrap().push(Arc::downgrade(pred));
    pred.successors.lock().unwrap().push(succ.clone());
}

/// Remove `pred -> succ`; true when the edge existed.
pub(crate) fn unlink(pred: &Arc<DagTask>, succ: &Arc<DagTask>) -> bool {
    let mut preds = succ.predecessors.lock().unwrap();
    let before = preds.len();
    preds.retain(|w| w.upgrade().map_or(false, |p| !Arc::ptr_eq(&p, pred)));
    let removed = preds.len() != before;
    drop(preds);
    pred.successors
        .lock()
        .unwrap()
        .retain(|s| !Arc::ptr_eq(s, succ));
    removed
}
