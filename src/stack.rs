//! Fiber stack allocation.
//!
//! Stacks come from a per-thread cache of size classes. A miss pulls a
//! batch from the process-wide central cache, which carves page-aligned
//! spans out of anonymous mappings. The lowest page of every stack is
//! remapped `PROT_NONE` so an overflow faults into the guard page instead
//! of silently corrupting a neighbouring allocation; the signal module
//! recognises such faults (see `signal`).
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::ptr;
use std::sync::Mutex;

const ALIGNMENT: usize = 8;
/// Stacks up to this usable size are recycled through the caches.
const MAX_CACHED_BYTES: usize = 256 * 1024;
/// Stacks fetched from the central cache per thread-cache miss.
const BATCH: usize = 4;
/// Per-class thread cache high-water mark; half spills back when crossed.
const CACHE_HIGH_WATER: usize = 16;

lazy_static! {
    static ref PAGE_SIZE: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
    static ref CENTRAL: Mutex<HashMap<usize, Vec<RawStack>>> = Mutex::new(HashMap::new());
}

#[derive(Clone, Copy)]
struct RawStack {
    base: *mut u8,
    /// Mapping length, guard page included.
    total: usize,
}

// Raw mapping addresses; ownership is tracked by the caches and `Stack`.
unsafe impl Send for RawStack {}

/// An owned fiber stack with a low guard page.
pub struct Stack {
    raw: RawStack,
    cached_class: Option<usize>,
}

unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Allocate a stack with at least `size` usable bytes.
    ///
    /// Panics when the OS refuses the mapping; callers are expected to
    /// bound the number of live fibers instead of handling stack OOM.
    pub fn alloc(size: usize) -> Stack {
        let class = round_up(size.max(ALIGNMENT));
        if class <= MAX_CACHED_BYTES {
            let raw = THREAD_CACHE.with(|cache| cache.borrow_mut().take(class));
            Stack {
                raw,
                cached_class: Some(class),
            }
        } else {
            Stack {
                raw: map_span(class, 1).pop().unwrap(),
                cached_class: None,
            }
        }
    }

    /// Lowest usable address (just above the guard page).
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.raw.base.add(*PAGE_SIZE) }
    }

    /// One past the highest usable address.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.raw.base.add(self.raw.total) }
    }

    pub fn usable(&self) -> usize {
        self.raw.total - *PAGE_SIZE
    }

    /// Whether `addr` falls into the inaccessible guard page.
    pub fn guard_contains(&self, addr: usize) -> bool {
        let guard = self.raw.base as usize;
        addr >= guard && addr < guard + *PAGE_SIZE
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        match self.cached_class {
            Some(class) => {
                let raw = self.raw;
                // The cache may already be gone during thread teardown.
                let cached =
                    THREAD_CACHE.try_with(|cache| cache.borrow_mut().put(class, raw));
                if cached.is_err() {
                    unmap(raw);
                }
            }
            None => unmap(self.raw),
        }
    }
}

fn round_up(bytes: usize) -> usize {
    (bytes + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Map one span holding `count` stacks of usable size `class`, each with
/// its own guard page at the low end.
fn map_span(class: usize, count: usize) -> Vec<RawStack> {
    let page = *PAGE_SIZE;
    let total = (class + page - 1) / page * page + page;
    let span = unsafe {
        libc::mmap(
            ptr::null_mut(),
            total * count,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if span == libc::MAP_FAILED {
        panic!("fiber stack mmap failed: {}", io::Error::last_os_error());
    }
    let mut stacks = Vec::with_capacity(count);
    for i in 0..count {
        let base = unsafe { (span as *mut u8).add(i * total) };
        if unsafe { libc::mprotect(base as *mut libc::c_void, page, libc::PROT_NONE) } != 0 {
            panic!(
                "fiber stack guard mprotect failed: {}",
                io::Error::last_os_error()
            );
        }
        stacks.push(RawStack { base, total });
    }
    stacks
}

fn unmap(raw: RawStack) {
    unsafe {
        libc::munmap(raw.base as *mut libc::c_void, raw.total);
    }
}

struct ThreadCache {
    free: HashMap<usize, Vec<RawStack>>,
}

impl ThreadCache {
    fn take(&mut self, class: usize) -> RawStack {
        let list = self.free.entry(class).or_insert_with(Vec::new);
        if let Some(raw) = list.pop() {
            return raw;
        }
        let mut central = CENTRAL.lock().unwrap();
        let pool = central.entry(class).or_insert_with(Vec::new);
        if pool.is_empty() {
            pool.extend(map_span(class, BATCH));
        }
        let raw = pool.pop().unwrap();
        let refill = BATCH.min(pool.len()) / 2;
        list.extend(pool.drain(pool.len() - refill..));
        raw
    }

    fn put(&mut self, class: usize, raw: RawStack) {
        let list = self.free.entry(class).or_insert_with(Vec::new);
        list.push(raw);
        if list.len() > CACHE_HIGH_WATER {
            let spill = list.split_off(list.len() / 2);
            CENTRAL
                .lock()
                .unwrap()
                .entry(class)
                .or_insert_with(Vec::new)
                .extend(spill);
        }
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        let mut central = CENTRAL.lock().unwrap();
        for (class, list) in self.free.drain() {
            central.entry(class).or_insert_with(Vec::new).extend(list);
        }
    }
}

thread_local! {
    static THREAD_CACHE: RefCell<ThreadCache> = RefCell::new(ThreadCache {
        free: HashMap::new(),
    });
}
