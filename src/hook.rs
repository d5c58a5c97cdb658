//! Cooperative blocking calls.
//!
//! Synchronous-looking I/O that suspends the calling fiber instead of the
//! OS thread. Every function here preserves the return-value/errno
//! contract of the libc call it stands in for: errors come back as
//! `io::Error` with the exact `raw_os_error`, so code written against
//! blocking sockets behaves identically, except that "blocking" now means
//! parking the fiber on the reactor.
//!
//! Hooking is per-thread: scheduler workers enable it on entry
//! ([`set_hook_enable`]). With the flag off, or for descriptors the fd
//! table does not classify as cooperative sockets (untracked fds,
//! non-sockets, user-requested nonblocking mode), calls pass straight
//! through to libc.
//!
//! The wait machinery is one template ([`do_io`]): issue the nonblocking
//! syscall, retry on EINTR, and on EAGAIN register the fd on the current
//! [`IoManager`], arm an optional condition timer bounding the wait with
//! the fd's SO_RCVTIMEO/SO_SNDTIMEO, and yield. The timer, if it still
//! finds the wait alive, stamps `ETIMEDOUT` and cancels the event so the
//! fiber wakes through the same path it would on readiness.
use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};

use crate::config::{Config, ConfigVar};
use crate::error::Error;
use crate::fd::{self, TimeoutKind};
use crate::fiber;
use crate::reactor::{Event, IoManager};
use crate::scheduler::Task;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Turn cooperative hooking on or off for the current thread.
pub fn set_hook_enable(enable: bool) {
    HOOK_ENABLED.with(|flag| flag.set(enable));
}

pub fn is_hook_enable() -> bool {
    HOOK_ENABLED.with(|flag| flag.get())
}

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(5000);

fn cache_connect_timeout(value: i64) {
    let ms = if value < 0 { fd::NO_TIMEOUT } else { value as u64 };
    CONNECT_TIMEOUT_MS.store(ms, Ordering::SeqCst);
}

lazy_static! {
    static ref TCP_CONNECT_TIMEOUT: Arc<ConfigVar<i64>> = {
        let var = Config::lookup("tcp.connect.timeout", 5000i64, "tcp connect timeout");
        cache_connect_timeout(var.value());
        var.add_listener(|old, new| {
            info!("tcp connect timeout changed from {} to {}", old, new);
            cache_connect_timeout(*new);
        });
        var
    };
}

fn connect_timeout_ms() -> u64 {
    lazy_static::initialize(&TCP_CONNECT_TIMEOUT);
    CONNECT_TIMEOUT_MS.load(Ordering::SeqCst)
}

#[derive(Default)]
struct WaitState {
    cancelled: AtomicI32,
}

fn check_ssize(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn check_rc(rc: libc::c_int) -> io::Result<()> {
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn retry_eintr(syscall: &mut impl FnMut() -> libc::ssize_t) -> libc::ssize_t {
    loop {
        let n = syscall();
        if n == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return n;
    }
}

/// Shared retry loop for the read/write families.
fn do_io(
    fd: RawFd,
    name: &'static str,
    event: Event,
    timeout_kind: TimeoutKind,
    mut syscall: impl FnMut() -> libc::ssize_t,
) -> io::Result<usize> {
    if !is_hook_enable() {
        return check_ssize(syscall());
    }
    let meta = match fd::fd_manager().get(fd, false) {
        Some(meta) => meta,
        None => return check_ssize(syscall()),
    };
    if meta.is_closed() {
        return Err(Error::Closed.into());
    }
    if !meta.is_socket() || meta.user_nonblock() {
        return check_ssize(syscall());
    }

    let timeout_ms = meta.timeout_ms(timeout_kind);
    let state = Arc::new(WaitState::default());
    loop {
        let n = retry_eintr(&mut syscall);
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EAGAIN) {
            return Err(err);
        }

        let iom = match IoManager::current() {
            Some(m) => m,
            None => return Err(err),
        };
        debug!("hook {}: fd={} waiting for {:?}", name, fd, event);

        let timer = if timeout_ms != fd::NO_TIMEOUT {
            let observer = Arc::downgrade(&state);
            let waker = iom.clone();
            Some(iom.add_condition_timer(
                timeout_ms,
                move || {
                    if let Some(state) = observer.upgrade() {
                        if state.cancelled.load(Ordering::SeqCst) == 0 {
                            state.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                            waker.cancel_event(fd, event);
                        }
                    }
                },
                Arc::downgrade(&state),
                false,
            ))
        } else {
            None
        };

        if let Err(e) = iom.add_event(fd, event, None) {
            if let Some(timer) = timer {
                timer.cancel();
            }
            error!("hook {}: add_event(fd={}, {:?}): {}", name, fd, event, e);
            return Err(e.into());
        }
        fiber::yield_now();
        // Either the fd turned ready, the timeout cancelled the wait, or
        // close() cancelled every wait on the fd.
        if let Some(timer) = timer {
            timer.cancel();
        }
        if state.cancelled.load(Ordering::SeqCst) != 0 {
            return Err(Error::Timeout.into());
        }
        if meta.is_closed() {
            return Err(Error::Cancelled.into());
        }
    }
}

// --- sleeps ------------------------------------------------------------

/// Cooperative sleep: a one-shot timer re-schedules the fiber.
pub fn sleep_ms(ms: u64) {
    if !is_hook_enable() {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    }
    let (iom, current) = match (IoManager::current(), fiber::current()) {
        (Some(iom), Some(current)) => (iom, current),
        _ => {
            std::thread::sleep(Duration::from_millis(ms));
            return;
        }
    };
    let scheduler = iom.scheduler().clone();
    iom.add_timer(
        ms,
        move || {
            if let Err(e) = scheduler.schedule(Task::from(current.clone())) {
                error!("sleep wakeup lost: {}", e);
            }
        },
        false,
    );
    fiber::yield_now();
}

pub fn sleep(duration: Duration) {
    sleep_ms(duration.as_millis() as u64);
}

pub fn sleep_us(us: u64) {
    sleep_ms(us / 1000);
}

// --- socket lifecycle --------------------------------------------------

/// `socket(2)`, registering the fd for cooperative I/O when hooked.
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    if is_hook_enable() {
        fd::fd_manager().get(fd, true);
    }
    Ok(fd)
}

/// `connect(2)` bounded by the `tcp.connect.timeout` config value.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    connect_with_timeout(fd, addr, connect_timeout_ms())
}

/// Nonblocking connect: on EINPROGRESS the fiber waits for WRITE
/// readiness (plus an optional timer), then reads SO_ERROR to tell
/// success from failure.
pub fn connect_with_timeout(fd: RawFd, addr: &SocketAddr, timeout_ms: u64) -> io::Result<()> {
    let (storage, len) = sockaddr_from(addr);
    let raw_connect =
        || unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if !is_hook_enable() {
        return check_rc(raw_connect());
    }
    let meta = match fd::fd_manager().get(fd, false) {
        Some(meta) => meta,
        None => return Err(io::Error::from_raw_os_error(libc::EBADF)),
    };
    if meta.is_closed() {
        return Err(Error::Closed.into());
    }
    if !meta.is_socket() || meta.user_nonblock() {
        return check_rc(raw_connect());
    }

    let rc = raw_connect();
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if rc != -1 || err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err);
    }

    let iom = match IoManager::current() {
        Some(m) => m,
        None => return Err(err),
    };
    let state = Arc::new(WaitState::default());
    let timer = if timeout_ms != fd::NO_TIMEOUT {
        let observer = Arc::downgrade(&state);
        let waker = iom.clone();
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                if let Some(state) = observer.upgrade() {
                    if state.cancelled.load(Ordering::SeqCst) == 0 {
                        state.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                        waker.cancel_event(fd, Event::WRITE);
                    }
                }
            },
            Arc::downgrade(&state),
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::WRITE, None) {
        Ok(()) => {
            fiber::yield_now();
            if let Some(timer) = timer {
                timer.cancel();
            }
            if state.cancelled.load(Ordering::SeqCst) != 0 {
                return Err(Error::Timeout.into());
            }
            if meta.is_closed() {
                return Err(Error::Cancelled.into());
            }
        }
        Err(e) => {
            if let Some(timer) = timer {
                timer.cancel();
            }
            error!("connect: add_event(fd={}, WRITE): {}", fd, e);
            return Err(e.into());
        }
    }

    let mut so_error: libc::c_int = 0;
    let mut opt_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut _ as *mut libc::c_void,
            &mut opt_len,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    if so_error == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(so_error))
    }
}

/// `accept(2)`; the accepted fd is registered for cooperative I/O.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let n = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, ptr::null_mut(), ptr::null_mut()) as libc::ssize_t
    })?;
    let accepted = n as RawFd;
    if is_hook_enable() {
        fd::fd_manager().get(accepted, true);
    }
    Ok(accepted)
}

/// Cancel every wait parked on `fd`, drop its metadata, close it.
///
/// Fibers blocked on the fd are woken through the cancellation path and
/// observe their wait as cancelled.
pub fn close(fd: RawFd) -> io::Result<()> {
    if is_hook_enable() {
        if fd::fd_manager().get(fd, false).is_some() {
            // Mark the meta closed before waking anyone: a waiter resumed
            // on another worker must observe the cancellation instead of
            // re-arming its wait.
            fd::fd_manager().del(fd);
            if let Some(iom) = IoManager::current() {
                iom.cancel_all(fd);
            }
        }
    }
    check_rc(unsafe { libc::close(fd) })
}

// --- read family -------------------------------------------------------

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let (ptr, len) = (buf.as_mut_ptr(), buf.len());
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, move || unsafe {
        libc::read(fd, ptr as *mut libc::c_void, len)
    })
}

pub fn readv(fd: RawFd, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
    let (ptr, len) = (bufs.as_mut_ptr(), bufs.len());
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, move || unsafe {
        libc::readv(fd, ptr as *const libc::iovec, len as libc::c_int)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    let (ptr, len) = (buf.as_mut_ptr(), buf.len());
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, move || unsafe {
        libc::recv(fd, ptr as *mut libc::c_void, len, flags)
    })
}

pub fn recv_from(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
) -> io::Result<(usize, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let (ptr, len) = (buf.as_mut_ptr(), buf.len());
    let storage_ptr = &mut storage as *mut libc::sockaddr_storage;
    let addr_len_ptr = &mut addr_len as *mut libc::socklen_t;
    let n = do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, move || unsafe {
        libc::recvfrom(
            fd,
            ptr as *mut libc::c_void,
            len,
            flags,
            storage_ptr as *mut libc::sockaddr,
            addr_len_ptr,
        )
    })?;
    Ok((n, sockaddr_to_addr(&storage)))
}

/// Raw `recvmsg(2)` with cooperative waiting. `msg` must stay valid for
/// the duration of the call, including across fiber suspension.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, move || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

// --- write family ------------------------------------------------------

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let (ptr, len) = (buf.as_ptr(), buf.len());
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, move || unsafe {
        libc::write(fd, ptr as *const libc::c_void, len)
    })
}

pub fn writev(fd: RawFd, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
    let (ptr, len) = (bufs.as_ptr(), bufs.len());
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, move || unsafe {
        libc::writev(fd, ptr as *const libc::iovec, len as libc::c_int)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
    let (ptr, len) = (buf.as_ptr(), buf.len());
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, move || unsafe {
        libc::send(fd, ptr as *const libc::c_void, len, flags)
    })
}

pub fn send_to(
    fd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
    addr: &SocketAddr,
) -> io::Result<usize> {
    let (storage, addr_len) = sockaddr_from(addr);
    let (ptr, len) = (buf.as_ptr(), buf.len());
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, move || unsafe {
        libc::sendto(
            fd,
            ptr as *const libc::c_void,
            len,
            flags,
            &storage as *const _ as *const libc::sockaddr,
            addr_len,
        )
    })
}

/// Raw `sendmsg(2)` with cooperative waiting; same validity contract as
/// [`recvmsg`].
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, move || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

// --- nonblock / timeout shims ------------------------------------------

/// `fcntl(F_SETFL, O_NONBLOCK)` semantics. For tracked sockets only the
/// user-visible flag changes; the kernel-level descriptor stays
/// nonblocking so internal waits keep working.
pub fn set_nonblocking(fd: RawFd, on: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut arg = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if let Some(meta) = fd::fd_manager().get(fd, false) {
        if meta.is_socket() && !meta.is_closed() {
            meta.set_user_nonblock(on);
            if meta.sys_nonblock() {
                arg |= libc::O_NONBLOCK;
            } else {
                arg &= !libc::O_NONBLOCK;
            }
        }
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, arg) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `fcntl(F_GETFL)` view of `O_NONBLOCK`: what the *user* configured, not
/// the forced kernel-level state.
pub fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Some(meta) = fd::fd_manager().get(fd, false) {
        if meta.is_socket() && !meta.is_closed() {
            return Ok(meta.user_nonblock());
        }
    }
    Ok(flags & libc::O_NONBLOCK != 0)
}

/// `ioctl(FIONBIO)` semantics, same user/kernel split as
/// [`set_nonblocking`].
pub fn ioctl_fionbio(fd: RawFd, on: bool) -> io::Result<()> {
    if let Some(meta) = fd::fd_manager().get(fd, false) {
        if meta.is_socket() && !meta.is_closed() {
            meta.set_user_nonblock(on);
            let mut kernel: libc::c_int = meta.sys_nonblock() as libc::c_int;
            let rc = unsafe { libc::ioctl(fd, libc::FIONBIO, &mut kernel) };
            return if rc == -1 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            };
        }
    }
    let mut arg: libc::c_int = on as libc::c_int;
    let rc = unsafe { libc::ioctl(fd, libc::FIONBIO, &mut arg) };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// `setsockopt(SO_RCVTIMEO)`: caches the timeout for hooked reads and
/// forwards it to the kernel.
pub fn set_recv_timeout(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    set_timeout(fd, TimeoutKind::Recv, libc::SO_RCVTIMEO, timeout)
}

/// `setsockopt(SO_SNDTIMEO)` counterpart of [`set_recv_timeout`].
pub fn set_send_timeout(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    set_timeout(fd, TimeoutKind::Send, libc::SO_SNDTIMEO, timeout)
}

pub fn recv_timeout(fd: RawFd) -> Option<Duration> {
    get_timeout(fd, TimeoutKind::Recv)
}

pub fn send_timeout(fd: RawFd) -> Option<Duration> {
    get_timeout(fd, TimeoutKind::Send)
}

fn set_timeout(
    fd: RawFd,
    kind: TimeoutKind,
    optname: libc::c_int,
    timeout: Option<Duration>,
) -> io::Result<()> {
    if is_hook_enable() {
        if let Some(meta) = fd::fd_manager().get(fd, false) {
            let ms = timeout
                .map(|d| d.as_millis() as u64)
                .unwrap_or(fd::NO_TIMEOUT);
            meta.set_timeout_ms(kind, ms);
        }
    }
    let duration = timeout.unwrap_or_else(|| Duration::from_secs(0));
    let tv = libc::timeval {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_usec: duration.subsec_micros() as libc::suseconds_t,
    };
    check_rc(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            optname,
            &tv as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    })
}

fn get_timeout(fd: RawFd, kind: TimeoutKind) -> Option<Duration> {
    let meta = fd::fd_manager().get(fd, false)?;
    let ms = meta.timeout_ms(kind);
    if ms == fd::NO_TIMEOUT {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

// --- sockaddr plumbing -------------------------------------------------

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::from((ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(sin6.sin6_port))))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_flag_is_per_thread() {
        assert!(!is_hook_enable());
        set_hook_enable(true);
        assert!(is_hook_enable());
        let other = std::thread::spawn(|| is_hook_enable()).join().unwrap();
        assert!(!other, "hook flag must not leak across threads");
        set_hook_enable(false);
    }

    #[test]
    fn passthrough_read_write_on_pipes() {
        // Hook disabled: plain libc semantics on a blocking pipe.
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(write(fds[1], b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(read(fds[0], &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        close(fds[0]).unwrap();
        close(fds[1]).unwrap();
    }

    #[test]
    fn sockaddr_round_trip() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to_addr(&storage), Some(addr));

        let addr6: SocketAddr = "[::1]:443".parse().unwrap();
        let (storage6, _) = sockaddr_from(&addr6);
        assert_eq!(sockaddr_to_addr(&storage6), Some(addr6));
    }

    #[test]
    fn connect_timeout_tracks_config() {
        assert_eq!(connect_timeout_ms(), 5000);
        TCP_CONNECT_TIMEOUT.set(250);
        assert_eq!(connect_timeout_ms(), 250);
        TCP_CONNECT_TIMEOUT.set(5000);
    }
}
