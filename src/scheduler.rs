//! Fiber scheduler: a worker thread pool draining a shared task queue.
//!
//! Tasks are fibers or plain closures (wrapped into a fiber on first
//! dispatch), optionally pinned to one worker thread. With `use_caller`
//! the constructing thread becomes a worker too: a root scheduling fiber
//! is parked on it and resumed from [`Scheduler::stop`], so the caller
//! drains its share of the queue during shutdown.
//!
//! Reactor integration happens through [`SchedulerHooks`]: the `IoManager`
//! overrides `tickle` (self-pipe wakeup), `idle` (epoll wait) and the
//! quiescence predicate, which is how the C++ original's virtual
//! inheritance maps onto composition.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;

use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, FiberFn, State};
use crate::hook;

/// Linux thread id, used to pin tasks to workers.
pub fn thread_id() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Any worker.
pub const ANY_THREAD: libc::pid_t = -1;

enum TaskKind {
    Fiber(Arc<Fiber>),
    Call(FiberFn),
}

/// Queue element: a fiber or a closure, plus an optional target thread.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Task {
    #[derivative(Debug = "ignore")]
    kind: TaskKind,
    thread: libc::pid_t,
}

impl Task {
    pub fn call(f: impl FnOnce() + Send + 'static) -> Task {
        Task {
            kind: TaskKind::Call(Box::new(f)),
            thread: ANY_THREAD,
        }
    }

    /// Pin this task to the worker with the given thread id.
    pub fn on_thread(mut self, thread: libc::pid_t) -> Task {
        self.thread = thread;
        self
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Task {
        Task {
            kind: TaskKind::Fiber(fiber),
            thread: ANY_THREAD,
        }
    }
}

/// Extension points a composing reactor overrides.
pub(crate) trait SchedulerHooks: Send + Sync {
    /// Runs once at the top of every worker thread.
    fn on_thread_start(&self) {}
    /// Wake a worker blocked in `idle`.
    fn tickle(&self);
    /// Body of the per-worker idle fiber.
    fn idle(&self);
    /// Extra condition ANDed into the quiescence predicate.
    fn quiescent_extra(&self) -> bool {
        true
    }
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Weak<Scheduler>>> = RefCell::new(None);
}

pub struct Scheduler {
    name: String,
    use_caller: bool,
    root_thread: libc::pid_t,
    weak_self: Weak<Scheduler>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    tasks: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    worker_count: AtomicUsize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stopping: AtomicBool,
    stopped: AtomicBool,
    started: AtomicBool,
    hooks: RwLock<Option<Weak<dyn SchedulerHooks>>>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers total. With `use_caller`
    /// the calling thread counts as one of them and `stop()` must later be
    /// invoked from this same thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler needs at least one thread");
        let worker_count = if use_caller { threads - 1 } else { threads };
        let root_thread = if use_caller { thread_id() } else { ANY_THREAD };

        let sched = Arc::new_cyclic(|weak: &Weak<Scheduler>| Scheduler {
            name: name.to_string(),
            use_caller,
            root_thread,
            weak_self: weak.clone(),
            root_fiber: Mutex::new(None),
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            worker_count: AtomicUsize::new(worker_count),
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            started: AtomicBool::new(false),
            hooks: RwLock::new(None),
        });

        if use_caller {
            fiber::ensure_main();
            assert!(
                Scheduler::current().is_none(),
                "caller thread already belongs to a scheduler"
            );
            CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(sched.weak_self.clone()));
            let weak = sched.weak_self.clone();
            let root = Fiber::new(
                move || {
                    if let Some(s) = weak.upgrade() {
                        s.run();
                    }
                },
                0,
                false,
            );
            fiber::set_scheduler_fiber(Some(root.clone()));
            *sched.root_fiber.lock().unwrap() = Some(root);
        }
        sched
    }

    /// Scheduler owning the current thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().as_ref().and_then(|w| w.upgrade()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        *self.hooks.write().unwrap() = Some(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.read().unwrap().as_ref().and_then(|w| w.upgrade())
    }

    fn arc(&self) -> Arc<Scheduler> {
        self.weak_self.upgrade().expect("scheduler was dropped while in use")
    }

    /// Spawn the worker threads. Safe to call once; repeat calls are
    /// no-ops, calls after `stop()` log a warning.
    pub fn start(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            warn!("scheduler {}: start after stop ignored", self.name);
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut threads = self.threads.lock().unwrap();
        for i in 0..self.worker_count.load(Ordering::SeqCst) {
            let worker = self.arc();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.name, i))
                .spawn(move || worker.run())
                .expect("failed to spawn scheduler worker");
            threads.push(handle);
        }
        info!(
            "scheduler {}: started, workers={} use_caller={}",
            self.name,
            threads.len(),
            self.use_caller
        );
    }

    /// Enqueue a task for any worker.
    pub fn schedule(&self, task: Task) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        let need_tickle = {
            let mut queue = self.tasks.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
        Ok(())
    }

    /// Enqueue a task pinned to one worker thread.
    pub fn schedule_on(&self, task: Task, thread: libc::pid_t) -> Result<()> {
        self.schedule(task.on_thread(thread))
    }

    /// Grow the worker pool to `new_count` workers. Shrinking is not
    /// supported: workers park inside their idle fiber and there is no
    /// per-thread exit signal.
    pub fn adjust_threads(&self, new_count: usize) {
        if self.stopping.load(Ordering::SeqCst) {
            warn!("scheduler {}: cannot adjust threads while stopping", self.name);
            return;
        }
        let mut threads = self.threads.lock().unwrap();
        let current = threads.len();
        if new_count <= current {
            if new_count < current {
                warn!(
                    "scheduler {}: shrinking {} -> {} workers is not supported",
                    self.name, current, new_count
                );
            }
            return;
        }
        for i in current..new_count {
            let worker = self.arc();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.name, i))
                .spawn(move || worker.run())
                .expect("failed to spawn scheduler worker");
            threads.push(handle);
        }
        self.worker_count.store(new_count, Ordering::SeqCst);
        info!("scheduler {}: grew to {} workers", self.name, new_count);
    }

    /// Stop the scheduler and join its workers. Idempotent. In
    /// `use_caller` mode this must run on the constructing thread, which
    /// first drains its own share of the queue.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.stopping.store(true, Ordering::SeqCst);

        if self.use_caller {
            if thread_id() != self.root_thread {
                return Err(Error::WrongThread);
            }
        } else if let Some(current) = Scheduler::current() {
            if std::ptr::eq(current.as_ref(), self) {
                return Err(Error::WrongThread);
            }
        }

        for _ in 0..self.worker_count.load(Ordering::SeqCst) {
            self.tickle();
        }
        let root = self.root_fiber.lock().unwrap().clone();
        if root.is_some() {
            self.tickle();
        }
        if let Some(root) = root {
            // Even with an empty queue the root fiber must run once so its
            // worker loop can observe quiescence and terminate.
            root.resume()?;
        }

        let workers = {
            let mut threads = self.threads.lock().unwrap();
            std::mem::replace(&mut *threads, Vec::new())
        };
        for handle in workers {
            if handle.join().is_err() {
                error!("scheduler {}: worker thread panicked", self.name);
            }
        }
        self.stopped.store(true, Ordering::SeqCst);
        debug!("scheduler {}: stopped", self.name);
        Ok(())
    }

    /// stop requested AND queue drained AND no worker mid-task.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.tasks.lock().unwrap().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    /// Full quiescence predicate, including the composing reactor's share.
    pub(crate) fn quiescent(&self) -> bool {
        self.base_stopping() && self.hooks().map(|h| h.quiescent_extra()).unwrap_or(true)
    }

    pub(crate) fn idle_thread_count(&self) -> usize {
        self.idle_threads.load(Ordering::SeqCst)
    }

    pub fn status_string(&self) -> String {
        format!(
            "[Scheduler name={} workers={} active={} idle={} stopping={}]",
            self.name,
            self.worker_count.load(Ordering::SeqCst),
            self.active_threads.load(Ordering::SeqCst),
            self.idle_threads.load(Ordering::SeqCst),
            self.stopping.load(Ordering::SeqCst),
        )
    }

    fn tickle(&self) {
        match self.hooks() {
            Some(hooks) => hooks.tickle(),
            None => debug!("scheduler {}: tickle", self.name),
        }
    }

    fn idle_loop(&self) {
        match self.hooks() {
            Some(hooks) => hooks.idle(),
            None => {
                while !self.quiescent() {
                    fiber::yield_now();
                }
            }
        }
    }

    /// Worker body. Runs on every pool thread, and inside the root fiber
    /// on the caller thread in `use_caller` mode.
    fn run(&self) {
        let tid = thread_id();
        debug!("scheduler {}: worker loop on thread {}", self.name, tid);
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(self.weak_self.clone()));
        hook::set_hook_enable(true);
        crate::signal::ensure_alt_stack();
        if tid != self.root_thread {
            let main = fiber::ensure_main();
            fiber::set_scheduler_fiber(Some(main));
        }
        if let Some(hooks) = self.hooks() {
            hooks.on_thread_start();
        }

        let idle = {
            let sched = self.arc();
            Fiber::new(move || sched.idle_loop(), 0, true)
        };
        let mut call_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut picked: Option<Task> = None;
            let mut tickle_me = false;
            {
                let mut queue = self.tasks.lock().unwrap();
                let mut i = 0;
                while i < queue.len() {
                    let task = &queue[i];
                    if task.thread != ANY_THREAD && task.thread != tid {
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    if let TaskKind::Fiber(f) = &task.kind {
                        // An event can re-schedule a fiber before it has
                        // finished yielding on another worker; leave it
                        // queued until its state settles.
                        if f.state() == State::Running {
                            tickle_me = true;
                            i += 1;
                            continue;
                        }
                    }
                    picked = queue.remove(i);
                    self.active_threads.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me |= !queue.is_empty();
            }
            if tickle_me {
                self.tickle();
            }

            match picked.map(|t| t.kind) {
                Some(TaskKind::Fiber(task_fiber)) => {
                    if let Err(e) = task_fiber.resume() {
                        error!(
                            "scheduler {}: fiber {} resume: {}",
                            self.name,
                            task_fiber.id(),
                            e
                        );
                    }
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                }
                Some(TaskKind::Call(cb)) => {
                    let task_fiber = match call_fiber.take() {
                        // Only Term fibers are stashed, so reset cannot fail.
                        Some(recycled) => match recycled.reset(cb) {
                            Ok(()) => recycled,
                            Err(e) => {
                                error!("scheduler {}: recycle failed: {}", self.name, e);
                                self.active_threads.fetch_sub(1, Ordering::SeqCst);
                                continue;
                            }
                        },
                        None => Fiber::new(cb, 0, true),
                    };
                    if let Err(e) = task_fiber.resume() {
                        error!(
                            "scheduler {}: call fiber {} resume: {}",
                            self.name,
                            task_fiber.id(),
                            e
                        );
                    }
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    if task_fiber.state() == State::Term {
                        call_fiber = Some(task_fiber);
                    }
                    // A suspended call fiber now belongs to whoever
                    // re-schedules it.
                }
                None => {
                    if idle.state() == State::Term {
                        debug!("scheduler {}: idle fiber terminated", self.name);
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::SeqCst);
                    if let Err(e) = idle.resume() {
                        error!("scheduler {}: idle resume: {}", self.name, e);
                        self.idle_threads.fetch_sub(1, Ordering::SeqCst);
                        break;
                    }
                    self.idle_threads.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        debug!("scheduler {}: worker loop on thread {} exited", self.name, tid);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug!("scheduler {}: dropped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn runs_scheduled_closures() {
        let sched = Scheduler::new(2, false, "test-pool");
        let hits = Arc::new(AtomicUsize::new(0));
        sched.start();
        for _ in 0..16 {
            let hits = hits.clone();
            sched
                .schedule(Task::call(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        sched.stop().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn single_worker_preserves_insertion_order() {
        let sched = Scheduler::new(1, false, "test-fifo");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let order = order.clone();
            sched
                .schedule(Task::call(move || order.lock().unwrap().push(i)))
                .unwrap();
        }
        sched.start();
        sched.stop().unwrap();
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn use_caller_drains_on_stop() {
        let sched = Scheduler::new(1, true, "test-caller");
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let hits = hits.clone();
            sched
                .schedule(Task::call(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        sched.start();
        // Nothing ran yet: the only worker is this thread.
        sched.stop().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn schedule_after_stop_errors() {
        let sched = Scheduler::new(1, false, "test-stopped");
        sched.start();
        sched.stop().unwrap();
        match sched.schedule(Task::call(|| {})) {
            Err(Error::Stopped) => {}
            other => panic!("expected Stopped, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn use_caller_stop_needs_the_caller_thread() {
        let sched = Scheduler::new(1, true, "test-wrong-thread");
        sched.start();
        let remote = sched.clone();
        let result = thread::spawn(move || remote.stop()).join().unwrap();
        match result {
            Err(Error::WrongThread) => {}
            other => panic!("expected WrongThread, got {:?}", other.map(|_| ())),
        }
        sched.stop().unwrap();
    }

    #[test]
    fn stop_is_idempotent() {
        let sched = Scheduler::new(1, false, "test-idem");
        sched.start();
        sched.stop().unwrap();
        sched.stop().unwrap();
    }

    #[test]
    fn scheduled_fibers_resume_where_they_left_off() {
        let sched = Scheduler::new(1, false, "test-refiber");
        sched.start();
        let progress = Arc::new(AtomicUsize::new(0));
        let seen = progress.clone();
        let worker = Arc::downgrade(&sched);
        let fiber = Fiber::new(
            move || {
                seen.fetch_add(1, Ordering::SeqCst);
                // Park and hand ourselves back to the queue.
                if let (Some(s), Some(me)) = (worker.upgrade(), fiber::current()) {
                    s.schedule(Task::from(me)).unwrap();
                }
                fiber::yield_now();
                seen.fetch_add(1, Ordering::SeqCst);
            },
            0,
            true,
        );
        sched.schedule(Task::from(fiber)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        sched.stop().unwrap();
        assert_eq!(progress.load(Ordering::SeqCst), 2);
    }
}
