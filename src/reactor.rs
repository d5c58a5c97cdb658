//! Epoll reactor.
//!
//! [`IoManager`] composes a [`Scheduler`] with a [`TimerManager`]: its
//! idle fiber blocks in `epoll_wait` for at most the nearest timer
//! deadline, wakes parked fibers when their fd turns ready, and feeds due
//! timer callbacks back into the worker pool. A self-pipe registered in
//! the epoll set breaks the wait whenever a task is enqueued or a timer
//! lands at the front.
//!
//! Event registration is one-shot per direction: delivering READ (or
//! WRITE) removes that bit from the fd's registered mask before the
//! stored handler is scheduled. `cancel_event` delivers the handler *as
//! if the event fired*, so a fiber parked on the fd wakes up and can
//! observe its cancellation flag; `del_event` removes silently.
use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{debug, error, warn};

use crate::error::{Error, Result};
use crate::fiber::{self, FiberFn};
use crate::scheduler::{Scheduler, SchedulerHooks, Task};
use crate::timer::{Timer, TimerManager};

bitflags! {
    /// Waitable directions. Bit placement matches `EPOLLIN`/`EPOLLOUT`;
    /// no other bits are accepted by the registration API.
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
struct EventHandler {
    #[derivative(Debug = "ignore")]
    scheduler: Arc<Scheduler>,
    #[derivative(Debug = "ignore")]
    task: Task,
}

#[derive(Default)]
struct FdEvents {
    registered: Event,
    read: Option<EventHandler>,
    write: Option<EventHandler>,
}

impl Default for Event {
    fn default() -> Event {
        Event::empty()
    }
}

struct FdContext {
    fd: RawFd,
    events: Mutex<FdEvents>,
}

thread_local! {
    static CURRENT_IO: RefCell<Option<Weak<IoManager>>> = RefCell::new(None);
}

const MAX_EVENTS: usize = 256;
/// Upper bound for one epoll_wait, so a worker re-checks the stop
/// predicate even with no timers armed.
const MAX_TIMEOUT_MS: u64 = 3000;

pub struct IoManager {
    weak_self: Weak<IoManager>,
    scheduler: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    epoll_fd: RawFd,
    tickle_fds: [RawFd; 2],
    pending_events: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
}

impl IoManager {
    /// Build the reactor and start its scheduler.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<IoManager>> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::Epoll(io::Error::last_os_error()));
        }
        let mut pipe = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(Error::IO(err));
        }

        let scheduler = Scheduler::new(threads, use_caller, name);
        let timers = TimerManager::new();
        let iom = Arc::new_cyclic(|weak: &Weak<IoManager>| IoManager {
            weak_self: weak.clone(),
            scheduler,
            timers,
            epoll_fd,
            tickle_fds: pipe,
            pending_events: AtomicUsize::new(0),
            contexts: RwLock::new(Vec::new()),
        });

        let mut wake = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, pipe[0], &mut wake) } != 0 {
            return Err(Error::Epoll(io::Error::last_os_error()));
        }

        iom.resize_contexts(32);
        let hooks: Weak<dyn SchedulerHooks> = iom.weak_self.clone();
        iom.scheduler.set_hooks(hooks);
        let front = iom.weak_self.clone();
        iom.timers.set_front_hook(Box::new(move || {
            if let Some(m) = front.upgrade() {
                m.tickle_pipe();
            }
        }));
        if use_caller {
            CURRENT_IO.with(|c| *c.borrow_mut() = Some(iom.weak_self.clone()));
        }
        iom.scheduler.start();
        Ok(iom)
    }

    /// Reactor driving the current thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IO.with(|c| c.borrow().as_ref().and_then(|w| w.upgrade()))
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    pub fn schedule(&self, task: Task) -> Result<()> {
        self.scheduler.schedule(task)
    }

    pub fn schedule_on(&self, task: Task, thread: libc::pid_t) -> Result<()> {
        self.scheduler.schedule_on(task, thread)
    }

    pub fn add_timer(
        &self,
        period_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        self.timers.add_timer(period_ms, cb, recurring)
    }

    pub fn add_condition_timer<W: ?Sized + Send + Sync + 'static>(
        &self,
        period_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        witness: Weak<W>,
        recurring: bool,
    ) -> Arc<Timer> {
        self.timers.add_condition_timer(period_ms, cb, witness, recurring)
    }

    pub fn stop(&self) -> Result<()> {
        self.scheduler.stop()
    }

    /// (fd, direction) registrations whose handler is still stored.
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// Park a handler on `fd` for one `event` direction.
    ///
    /// With `cb` the callback is scheduled when the event fires;
    /// without, the currently running fiber is stored and re-scheduled
    /// instead; the add/yield pair is how hooked syscalls wait.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<FiberFn>) -> Result<()> {
        if event != Event::READ && event != Event::WRITE {
            return Err(Error::InvalidState("add_event takes exactly READ or WRITE"));
        }
        if fd < 0 {
            return Err(Error::InvalidState("add_event on a negative fd"));
        }
        let task = match cb {
            Some(f) => Task::call(f),
            None => {
                let current = fiber::current().ok_or(Error::InvalidState(
                    "add_event without a callback requires a running fiber",
                ))?;
                Task::from(current)
            }
        };

        let ctx = self.context_for(fd);
        let mut events = ctx.events.lock().unwrap();
        if events.registered.contains(event) {
            error!("add_event: fd={} {:?} already registered", fd, event);
            return Err(Error::AlreadyRegistered { fd, event });
        }
        let new_mask = events.registered | event;
        let op = if events.registered.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.epoll_update(op, fd, new_mask)?;
        events.registered = new_mask;
        self.pending_events.fetch_add(1, Ordering::SeqCst);
        let handler = EventHandler {
            scheduler: self.scheduler.clone(),
            task,
        };
        if event == Event::READ {
            events.read = Some(handler);
        } else {
            events.write = Some(handler);
        }
        Ok(())
    }

    /// Remove a registration without invoking its handler.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.remove_event(fd, event, false)
    }

    /// Remove a registration and deliver its handler as if the event had
    /// fired. The woken waiter is expected to check its cancellation
    /// state; "cancel races fire" means exactly one of the two happens.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.remove_event(fd, event, true)
    }

    /// `cancel_event` over every registered direction of `fd`.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut events = ctx.events.lock().unwrap();
        if events.registered.is_empty() {
            return false;
        }
        if self.epoll_update(libc::EPOLL_CTL_DEL, fd, Event::empty()).is_err() {
            return false;
        }
        events.registered = Event::empty();
        let read = events.read.take();
        let write = events.write.take();
        drop(events);
        self.deliver(read);
        self.deliver(write);
        true
    }

    fn remove_event(&self, fd: RawFd, event: Event, trigger: bool) -> bool {
        if event != Event::READ && event != Event::WRITE {
            return false;
        }
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut events = ctx.events.lock().unwrap();
        if !events.registered.contains(event) {
            return false;
        }
        let left = events.registered - event;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_update(op, fd, left).is_err() {
            return false;
        }
        events.registered = left;
        let handler = if event == Event::READ {
            events.read.take()
        } else {
            events.write.take()
        };
        drop(events);
        if trigger {
            self.deliver(handler);
        } else if handler.is_some() {
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        true
    }

    fn deliver(&self, handler: Option<EventHandler>) {
        if let Some(handler) = handler {
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = handler.scheduler.schedule(handler.task) {
                error!("io manager: event dispatch failed: {}", e);
            }
        }
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().unwrap().get(fd as usize).cloned()
    }

    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        if let Some(ctx) = self.lookup(fd) {
            return ctx;
        }
        let mut contexts = self.contexts.write().unwrap();
        let needed = fd as usize + 1;
        if contexts.len() < needed {
            let target = needed + needed / 2;
            for i in contexts.len()..target {
                contexts.push(Arc::new(FdContext {
                    fd: i as RawFd,
                    events: Mutex::new(FdEvents::default()),
                }));
            }
        }
        contexts[fd as usize].clone()
    }

    fn resize_contexts(&self, size: usize) {
        let mut contexts = self.contexts.write().unwrap();
        for i in contexts.len()..size {
            contexts.push(Arc::new(FdContext {
                fd: i as RawFd,
                events: Mutex::new(FdEvents::default()),
            }));
        }
    }

    fn epoll_update(&self, op: libc::c_int, fd: RawFd, mask: Event) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | mask.bits(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            error!(
                "epoll_ctl(op={}, fd={}, mask={:?}): {}",
                op, fd, mask, err
            );
            return Err(Error::Epoll(err));
        }
        Ok(())
    }

    fn tickle_pipe(&self) {
        let byte = b"T";
        let rc = unsafe { libc::write(self.tickle_fds[1], byte.as_ptr() as *const libc::c_void, 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                warn!("io manager: tickle write failed: {}", err);
            }
        }
    }

    fn drain_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let rc = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rc <= 0 {
                break;
            }
        }
    }

    fn idle_loop(&self) {
        debug!("io manager: idle loop entered");
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            let next_timeout = self.timers.next_timeout_ms();
            if next_timeout == u64::max_value()
                && self.pending_events.load(Ordering::SeqCst) == 0
                && self.scheduler.base_stopping()
            {
                debug!("io manager: idle loop exits");
                break;
            }
            let timeout = next_timeout.min(MAX_TIMEOUT_MS) as libc::c_int;
            let count = unsafe {
                libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as libc::c_int, timeout)
            };
            if count < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                error!("io manager: epoll_wait: {}", err);
                continue;
            }

            let mut due = Vec::new();
            self.timers.list_expired(&mut due);
            for cb in due {
                if let Err(e) = self.scheduler.schedule(Task::call(move || cb())) {
                    error!("io manager: timer dispatch failed: {}", e);
                }
            }

            for ev in events.iter().take(count as usize) {
                let fd = ev.u64 as RawFd;
                if fd == self.tickle_fds[0] {
                    self.drain_pipe();
                    continue;
                }
                let ctx = match self.lookup(fd) {
                    Some(ctx) => ctx,
                    None => continue,
                };
                let mut state = ctx.events.lock().unwrap();
                let mut revents = ev.events;
                // Error and hangup wake every registered direction so the
                // parked operation can observe the failure itself.
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & state.registered.bits();
                }
                let ready = Event::from_bits_truncate(revents) & state.registered;
                if ready.is_empty() {
                    continue;
                }
                let left = state.registered - ready;
                let op = if left.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                if self.epoll_update(op, ctx.fd, left).is_err() {
                    continue;
                }
                state.registered = left;
                if ready.contains(Event::READ) {
                    let handler = state.read.take();
                    self.deliver(handler);
                }
                if ready.contains(Event::WRITE) {
                    let handler = state.write.take();
                    self.deliver(handler);
                }
            }

            // Hand control back so the worker can run whatever the wakeups
            // queued; the scheduler resumes us when the queue drains.
            fiber::yield_now();
        }
    }
}

impl SchedulerHooks for IoManager {
    fn on_thread_start(&self) {
        CURRENT_IO.with(|c| *c.borrow_mut() = Some(self.weak_self.clone()));
    }

    fn tickle(&self) {
        if self.scheduler.idle_thread_count() == 0 {
            return;
        }
        self.tickle_pipe();
    }

    fn idle(&self) {
        self.idle_loop();
    }

    fn quiescent_extra(&self) -> bool {
        self.pending_events.load(Ordering::SeqCst) == 0 && !self.timers.has_timer()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
        debug!("io manager dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) },
            0
        );
        (fds[0], fds[1])
    }

    #[test]
    fn read_event_fires_when_data_arrives() {
        let iom = IoManager::new(1, false, "reactor-read").unwrap();
        let (rx, tx) = pipe_pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        iom.add_event(
            rx,
            Event::READ,
            Some(Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(iom.pending_event_count(), 1);

        unsafe { libc::write(tx, b"x".as_ptr() as *const libc::c_void, 1) };
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop().unwrap();
        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn add_then_del_is_a_no_op() {
        let iom = IoManager::new(1, false, "reactor-del").unwrap();
        let (rx, tx) = pipe_pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        iom.add_event(
            rx,
            Event::READ,
            Some(Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert!(iom.del_event(rx, Event::READ));
        assert_eq!(iom.pending_event_count(), 0);

        unsafe { libc::write(tx, b"x".as_ptr() as *const libc::c_void, 1) };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 0, "deleted handler must not run");

        iom.stop().unwrap();
        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn cancel_event_triggers_the_handler() {
        let iom = IoManager::new(1, false, "reactor-cancel").unwrap();
        let (rx, tx) = pipe_pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        iom.add_event(
            rx,
            Event::READ,
            Some(Box::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert!(iom.cancel_event(rx, Event::READ));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1, "cancel delivers as-if-fired");
        assert_eq!(iom.pending_event_count(), 0);
        // Idempotent after the fact.
        assert!(!iom.cancel_event(rx, Event::READ));

        iom.stop().unwrap();
        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn double_registration_is_rejected() {
        let iom = IoManager::new(1, false, "reactor-dup").unwrap();
        let (rx, tx) = pipe_pair();
        iom.add_event(rx, Event::READ, Some(Box::new(|| {}))).unwrap();
        match iom.add_event(rx, Event::READ, Some(Box::new(|| {}))) {
            Err(Error::AlreadyRegistered { fd, event }) => {
                assert_eq!(fd, rx);
                assert_eq!(event, Event::READ);
            }
            other => panic!("expected AlreadyRegistered, got {:?}", other.map(|_| ())),
        }
        assert!(iom.cancel_all(rx));
        iom.stop().unwrap();
        unsafe {
            libc::close(rx);
            libc::close(tx);
        }
    }

    #[test]
    fn rejects_combined_event_masks() {
        let iom = IoManager::new(1, false, "reactor-mask").unwrap();
        let (rx, _tx) = pipe_pair();
        assert!(iom
            .add_event(rx, Event::READ | Event::WRITE, Some(Box::new(|| {})))
            .is_err());
        iom.stop().unwrap();
    }

    #[test]
    fn timers_drive_through_the_reactor() {
        let iom = IoManager::new(1, false, "reactor-timer").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        iom.add_timer(
            30,
            move || {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        iom.stop().unwrap();
    }
}
