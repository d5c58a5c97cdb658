//! Stackful fibers.
//!
//! A fiber is a cooperatively scheduled coroutine carrying its own stack
//! and saved register context. Control moves only at explicit points:
//! [`Fiber::resume`] jumps into a Ready fiber, [`yield_now`] saves the
//! running fiber and jumps back to the context that resumed it: the
//! worker's scheduling fiber when the fiber was created with
//! `run_in_scheduler`, the thread's main fiber otherwise.
//!
//! Every OS thread lazily owns a stackless *main* fiber representing its
//! native stack. At most one fiber per thread is Running at any instant;
//! the scheduler guarantees a suspended fiber is handed to exactly one
//! worker at a time, which is what makes the `Send + Sync` impls below
//! sound.
//!
//! ```no_run
//! use filament::fiber::{self, Fiber};
//!
//! let fiber = Fiber::new(
//!     || {
//!         println!("first half");
//!         fiber::yield_now();
//!         println!("second half");
//!     },
//!     0,
//!     false,
//! );
//! fiber.resume().unwrap(); // prints "first half"
//! fiber.resume().unwrap(); // prints "second half"
//! ```
use std::cell::{Cell, RefCell, UnsafeCell};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error};

use crate::config::{Config, ConfigVar};
use crate::error::{Error, Result};
use crate::stack::Stack;

pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// Fiber life cycle. Created Ready, Running while on a CPU, Term once the
/// callback returned. A suspended fiber goes back to Ready.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Ready = 0,
    Running = 1,
    Term = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Ready,
            1 => State::Running,
            _ => State::Term,
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

lazy_static! {
    static ref STACK_SIZE: Arc<ConfigVar<u32>> =
        Config::lookup("fiber.stack_size", 128 * 1024u32, "fiber stack size");
}

pub struct Fiber {
    id: u64,
    run_in_scheduler: bool,
    state: AtomicU8,
    ctx: UnsafeCell<libc::ucontext_t>,
    stack: Option<Stack>,
    cb: Mutex<Option<FiberFn>>,
}

// Safety: the context and callback are only touched by the single thread
// currently resuming the fiber; the scheduler queue transfers that right
// between threads with its own synchronization, and `state` is atomic.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static SCHEDULER_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    // Signal-safe mirrors of the above, see `signal`.
    static CURRENT_RAW: Cell<*const Fiber> = Cell::new(ptr::null());
    static RETURN_CTX: Cell<*mut libc::ucontext_t> = Cell::new(ptr::null_mut());
}

impl Fiber {
    /// Create a Ready fiber running `cb` once resumed.
    ///
    /// `stack_size` of 0 takes the `fiber.stack_size` config value
    /// (default 128 KiB). With `run_in_scheduler` the fiber suspends back
    /// to the worker's scheduling fiber, which is what every fiber going
    /// through a [`Scheduler`](crate::scheduler::Scheduler) wants;
    /// standalone fibers resumed from plain code pass `false`.
    pub fn new(cb: impl FnOnce() + Send + 'static, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber> {
        let size = if stack_size == 0 {
            STACK_SIZE.value() as usize
        } else {
            stack_size
        };
        let fiber = Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler,
            state: AtomicU8::new(State::Ready as u8),
            ctx: UnsafeCell::new(unsafe { mem::zeroed() }),
            stack: Some(Stack::alloc(size)),
            cb: Mutex::new(Some(Box::new(cb))),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        if let Some(stack) = fiber.stack.as_ref() {
            unsafe { fiber.make_context(stack) };
        }
        debug!("fiber {} created", fiber.id);
        fiber
    }

    fn new_main() -> Arc<Fiber> {
        let fiber = Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler: false,
            state: AtomicU8::new(State::Running as u8),
            ctx: UnsafeCell::new(unsafe { mem::zeroed() }),
            stack: None,
            cb: Mutex::new(None),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        debug!("fiber {} created (thread main)", fiber.id);
        fiber
    }

    unsafe fn make_context(&self, stack: &Stack) {
        let ctx = self.ctx.get();
        if libc::getcontext(ctx) != 0 {
            panic!("getcontext: {}", std::io::Error::last_os_error());
        }
        (*ctx).uc_stack.ss_sp = stack.bottom() as *mut libc::c_void;
        (*ctx).uc_stack.ss_size = stack.usable();
        (*ctx).uc_link = ptr::null_mut();
        libc::makecontext(ctx, fiber_entry, 0);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn run_in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }

    /// Rearm a Term fiber with a fresh callback, reusing its stack.
    pub fn reset(&self, cb: impl FnOnce() + Send + 'static) -> Result<()> {
        let stack = self
            .stack
            .as_ref()
            .ok_or(Error::InvalidState("reset on a stackless fiber"))?;
        if self.state() != State::Term {
            return Err(Error::InvalidState("reset requires a Term fiber"));
        }
        *self.cb.lock().unwrap() = Some(Box::new(cb));
        unsafe { self.make_context(stack) };
        self.set_state(State::Ready);
        Ok(())
    }

    /// Transfer control into this fiber until it yields or terminates.
    ///
    /// Must be called from the context the fiber suspends back to: the
    /// thread's scheduling fiber for `run_in_scheduler` fibers, the
    /// thread's main fiber otherwise.
    pub fn resume(self: &Arc<Self>) -> Result<()> {
        if self.state() != State::Ready {
            return Err(Error::InvalidState("resume requires a Ready fiber"));
        }
        let from = if self.run_in_scheduler {
            scheduler_fiber().ok_or(Error::InvalidState(
                "resume of a scheduler-managed fiber outside a worker thread",
            ))?
        } else {
            ensure_main()
        };
        if Arc::ptr_eq(&from, self) {
            return Err(Error::InvalidState("a fiber cannot resume itself"));
        }
        self.set_state(State::Running);
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        CURRENT_RAW.with(|c| c.set(Arc::as_ptr(self)));
        let from_ctx = from.ctx.get();
        let to_ctx = self.ctx.get();
        let prev_return = RETURN_CTX.with(|c| c.replace(from_ctx));
        let rc = unsafe { libc::swapcontext(from_ctx, to_ctx) };
        RETURN_CTX.with(|c| c.set(prev_return));
        // Control is back in `from`'s context. A normal yield already
        // republished it as current; the guard-page recovery path jumps
        // here directly and has not.
        CURRENT_RAW.with(|c| c.set(Arc::as_ptr(&from)));
        CURRENT.with(|c| *c.borrow_mut() = Some(from));
        if rc != 0 {
            // The switch never happened; undo the state transition.
            error!(
                "fiber {}: swapcontext failed: {}",
                self.id,
                std::io::Error::last_os_error()
            );
            self.set_state(State::Ready);
            return Err(Error::InvalidState("context switch failed"));
        }
        Ok(())
    }

    pub(crate) fn guard_contains(&self, addr: usize) -> bool {
        self.stack
            .as_ref()
            .map(|s| s.guard_contains(addr))
            .unwrap_or(false)
    }

    pub(crate) fn force_term(&self) {
        self.set_state(State::Term);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() && self.state() != State::Term {
            // The stack unwinds nowhere; values parked on it leak.
            error!("fiber {} dropped while {:?}", self.id, self.state());
            debug_assert!(false, "fiber dropped before terminating");
        }
        debug!("fiber {} destroyed", self.id);
    }
}

/// Create a Ready fiber with default stack size, set up for scheduler use.
pub fn spawn(f: impl FnOnce() + Send + 'static) -> Arc<Fiber> {
    Fiber::new(f, 0, true)
}

/// The fiber currently running on this thread, if any.
pub fn current() -> Option<Arc<Fiber>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Id of the running fiber, 0 when called outside fiber context.
pub fn current_id() -> u64 {
    current().map(|f| f.id()).unwrap_or(0)
}

/// Number of live fibers in the process, thread mains included.
pub fn total_fibers() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

/// Suspend the running fiber.
///
/// A Running fiber goes back to Ready and control returns to the context
/// that resumed it; nothing re-queues the fiber automatically. Yielding
/// outside any fiber, or from a thread main fiber, logs an error and
/// returns.
pub fn yield_now() {
    let from_ctx;
    let to_ctx;
    {
        let cur = match current() {
            Some(c) => c,
            None => {
                error!("yield_now outside of any fiber");
                return;
            }
        };
        let to = if cur.run_in_scheduler {
            scheduler_fiber()
        } else {
            thread_main()
        };
        let to = match to {
            Some(t) if !Arc::ptr_eq(&t, &cur) => t,
            _ => {
                error!("fiber {}: no context to yield to", cur.id);
                return;
            }
        };
        if cur.state() != State::Term {
            cur.set_state(State::Ready);
        }
        from_ctx = cur.ctx.get();
        to_ctx = to.ctx.get();
        CURRENT_RAW.with(|c| c.set(Arc::as_ptr(&to)));
        CURRENT.with(|c| *c.borrow_mut() = Some(to));
        // Both arcs drop here; the resumer still holds one, so the raw
        // context pointers stay valid across the switch.
    }
    unsafe {
        libc::swapcontext(from_ctx, to_ctx);
    }
}

/// The thread's main fiber, created on first use.
pub(crate) fn ensure_main() -> Arc<Fiber> {
    if let Some(main) = thread_main() {
        return main;
    }
    let main = Fiber::new_main();
    THREAD_MAIN.with(|m| *m.borrow_mut() = Some(main.clone()));
    CURRENT.with(|c| {
        let mut cur = c.borrow_mut();
        if cur.is_none() {
            *cur = Some(main.clone());
            CURRENT_RAW.with(|r| r.set(Arc::as_ptr(&main)));
        }
    });
    main
}

pub(crate) fn thread_main() -> Option<Arc<Fiber>> {
    THREAD_MAIN.with(|m| m.borrow().clone())
}

/// Install the fiber task fibers on this thread suspend back to.
pub(crate) fn set_scheduler_fiber(fiber: Option<Arc<Fiber>>) {
    SCHEDULER_FIBER.with(|s| *s.borrow_mut() = fiber);
}

pub(crate) fn scheduler_fiber() -> Option<Arc<Fiber>> {
    SCHEDULER_FIBER.with(|s| s.borrow().clone())
}

/// Signal-handler view of the running fiber. Plain pointer read, no
/// allocation, no locking.
pub(crate) fn current_raw() -> *const Fiber {
    CURRENT_RAW.with(|c| c.get())
}

/// Context the running fiber was resumed from, for signal recovery.
pub(crate) fn return_ctx() -> *mut libc::ucontext_t {
    RETURN_CTX.with(|c| c.get())
}

extern "C" fn fiber_entry() {
    // Entered exactly once per (re)armed fiber, via resume() which has
    // already published the fiber as current.
    let cur = match current() {
        Some(c) => c,
        None => std::process::abort(),
    };
    let cb = cur.cb.lock().unwrap().take();
    match cb {
        Some(cb) => {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cb)) {
                error!("fiber {} failed: {}", cur.id, panic_message(&payload));
            }
        }
        None => error!("fiber {} resumed without a callback", cur.id),
    }
    cur.set_state(State::Term);
    drop(cur);
    yield_now();
    // A Term fiber cannot be resumed, so control never comes back.
    std::process::abort();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn resume_yield_roundtrip() {
        let steps = Arc::new(AtomicUsize::new(0));
        let observed = steps.clone();
        let fiber = Fiber::new(
            move || {
                observed.fetch_add(1, Ordering::SeqCst);
                yield_now();
                observed.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume().unwrap();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume().unwrap();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn resume_after_term_is_invalid() {
        let fiber = Fiber::new(|| {}, 0, false);
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), State::Term);
        assert!(fiber.resume().is_err());
    }

    #[test]
    fn reset_reuses_a_terminated_fiber() {
        let hits = Arc::new(AtomicUsize::new(0));
        let first = hits.clone();
        let fiber = Fiber::new(move || { first.fetch_add(1, Ordering::SeqCst); }, 0, false);
        assert!(fiber.reset(|| {}).is_err()); // still Ready
        fiber.resume().unwrap();

        let second = hits.clone();
        fiber
            .reset(move || { second.fetch_add(10, Ordering::SeqCst); })
            .unwrap();
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn panic_inside_fiber_terminates_it() {
        let fiber = Fiber::new(|| panic!("boom"), 0, false);
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = Fiber::new(|| {}, 0, false);
        let b = Fiber::new(|| {}, 0, false);
        assert!(b.id() > a.id());
        a.resume().unwrap();
        b.resume().unwrap();
    }

    #[test]
    fn current_id_tracks_the_running_fiber() {
        assert_eq!(current_id(), current().map(|f| f.id()).unwrap_or(0));
        let seen = Arc::new(AtomicU64::new(u64::max_value()));
        let inner = seen.clone();
        let fiber = Fiber::new(
            move || inner.store(current_id(), Ordering::SeqCst),
            0,
            false,
        );
        let expect = fiber.id();
        fiber.resume().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), expect);
    }
}
