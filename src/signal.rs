//! Guard-page fault recovery.
//!
//! Every fiber stack carries an inaccessible page at its low end (see
//! `stack`). [`init`] installs a SIGSEGV/SIGBUS handler that checks the
//! faulting address against the running fiber's guard page: on a match
//! the fiber is marked terminal and control jumps straight back to the
//! context that resumed it, so one runaway fiber does not take the
//! process down. Faults outside any guard page re-raise with the default
//! disposition.
//!
//! The handler allocates nothing and takes no locks. It reads two raw
//! thread-locals maintained by the fiber module and calls
//! `write`/`setcontext`. Workers install a `sigaltstack` so the handler
//! can run while the faulting fiber stack is exhausted; `setcontext`
//! restores the saved signal mask, which keeps SIGSEGV deliverable
//! afterwards.
//!
//! The aborted fiber's stack frames never unwind: values parked on that
//! stack leak. That is the documented price of recovery, identical to
//! the cancellation-free termination the rest of the runtime assumes.
use std::cell::Cell;
use std::io;
use std::mem;
use std::ptr;
use std::sync::Once;

use log::{error, info};

use crate::fiber;

static INSTALL: Once = Once::new();

/// Install the fault handler once per process. Threads that resume
/// fibers should also have an alternate signal stack; scheduler workers
/// set one up automatically.
pub fn init() {
    INSTALL.call_once(|| {
        ensure_alt_stack();
        unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                guard_fault_handler;
            sa.sa_sigaction = handler as usize;
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(libc::SIGSEGV, &sa, ptr::null_mut()) != 0 {
                error!("sigaction(SIGSEGV): {}", io::Error::last_os_error());
            }
            if libc::sigaction(libc::SIGBUS, &sa, ptr::null_mut()) != 0 {
                error!("sigaction(SIGBUS): {}", io::Error::last_os_error());
            }
        }
        info!("guard-page fault handler installed");
    });
}

thread_local! {
    static ALT_STACK: Cell<bool> = Cell::new(false);
}

/// Give the current thread an alternate stack for fault handling. The
/// guard-page handler cannot run on a fiber stack that just overflowed.
pub(crate) fn ensure_alt_stack() {
    ALT_STACK.with(|installed| {
        if installed.get() {
            return;
        }
        unsafe {
            let size = libc::SIGSTKSZ.max(64 * 1024);
            let sp = libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if sp == libc::MAP_FAILED {
                error!("sigaltstack mmap: {}", io::Error::last_os_error());
                return;
            }
            let ss = libc::stack_t {
                ss_sp: sp,
                ss_flags: 0,
                ss_size: size,
            };
            if libc::sigaltstack(&ss, ptr::null_mut()) != 0 {
                error!("sigaltstack: {}", io::Error::last_os_error());
                libc::munmap(sp, size);
                return;
            }
        }
        installed.set(true);
    });
}

extern "C" fn guard_fault_handler(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    unsafe {
        let fault_addr = (*info).si_addr() as usize;
        let fiber_ptr = fiber::current_raw();
        if !fiber_ptr.is_null() && (*fiber_ptr).guard_contains(fault_addr) {
            let resume_ctx = fiber::return_ctx();
            if !resume_ctx.is_null() {
                const MSG: &[u8] = b"filament: fiber stack overflow, terminating fiber\n";
                libc::write(2, MSG.as_ptr() as *const libc::c_void, MSG.len());
                (*fiber_ptr).force_term();
                libc::setcontext(resume_ctx);
                // setcontext only returns on failure; fall through to the
                // default disposition below.
            }
        }
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(signo, &sa, ptr::null_mut());
        libc::raise(signo);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{Fiber, State};

    fn burn_stack(depth: usize, sink: &mut u64) {
        // Keep each frame real so the recursion walks down page by page.
        let mut local = [depth as u64; 16];
        local[depth % 16] = local[depth % 16].wrapping_add(1);
        *sink = sink.wrapping_add(local[depth % 16]);
        if depth < 10_000_000 {
            burn_stack(depth + 1, sink);
        }
        std::hint::black_box(sink);
    }

    #[test]
    fn overflowing_fiber_is_terminated_not_the_process() {
        init();
        let fiber = Fiber::new(
            || {
                let mut sink = 0u64;
                burn_stack(0, &mut sink);
            },
            32 * 1024,
            false,
        );
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), State::Term);

        // The thread keeps working afterwards.
        let follow_up = Fiber::new(|| {}, 0, false);
        follow_up.resume().unwrap();
        assert_eq!(follow_up.state(), State::Term);
    }
}
