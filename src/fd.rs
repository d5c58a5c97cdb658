//! Per-fd metadata.
//!
//! The hook layer consults this table to decide whether a descriptor
//! takes the cooperative path: only sockets that the user has not put in
//! nonblocking mode themselves get parked on the reactor. First contact
//! with an fd classifies it with `fstat` and, for sockets, forces
//! `O_NONBLOCK` at the kernel level via the raw (un-hooked) `fcntl`;
//! the user-visible blocking behaviour is preserved by the hooks, see
//! `hook::is_nonblocking`.
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Sentinel for "no timeout configured".
pub const NO_TIMEOUT: u64 = u64::max_value();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// SO_RCVTIMEO
    Recv,
    /// SO_SNDTIMEO
    Send,
}

pub struct FdMeta {
    fd: RawFd,
    initialized: bool,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdMeta {
    fn new(fd: RawFd) -> FdMeta {
        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        let (initialized, is_socket) = if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } == -1 {
            (false, false)
        } else {
            let mode = unsafe { stat.assume_init() }.st_mode;
            (true, mode & libc::S_IFMT == libc::S_IFSOCK)
        };

        let mut sys_nonblock = false;
        if is_socket {
            // Raw fcntl: the hooked variant would recurse into this table.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdMeta {
            fd,
            initialized,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    pub fn timeout_ms(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout_ms(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// Growable fd → metadata table. A `None` slot means "not yet tracked".
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdMeta>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            slots: RwLock::new(vec![None; 64]),
        }
    }

    /// Fetch the metadata for `fd`, creating it when `auto_create`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdMeta>> {
        if fd < 0 {
            return None;
        }
        let index = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            match slots.get(index) {
                Some(Some(meta)) => return Some(meta.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }
        let mut slots = self.slots.write().unwrap();
        if index >= slots.len() {
            slots.resize(index + index / 2 + 1, None);
        }
        if let Some(meta) = &slots[index] {
            return Some(meta.clone());
        }
        let meta = Arc::new(FdMeta::new(fd));
        slots[index] = Some(meta.clone());
        Some(meta)
    }

    /// Forget `fd`. The next `get(auto_create)` re-classifies it.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(meta) = slot.take() {
                meta.mark_closed();
            }
        }
    }
}

lazy_static! {
    static ref FD_MANAGER: FdManager = FdManager::new();
}

/// The process-wide fd table.
pub fn fd_manager() -> &'static FdManager {
    &FD_MANAGER
}
