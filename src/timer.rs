//! Ordered timer set.
//!
//! Timers sort by (deadline, insertion sequence), so equal deadlines fire
//! in creation order. The owning [`TimerManager`] only produces due
//! callbacks ([`TimerManager::list_expired`]); running them is the
//! caller's business; the reactor schedules them onto its worker pool.
//!
//! An insertion that becomes the new front invokes the `front hook`
//! outside the lock; the reactor uses it to cut a blocked `epoll_wait`
//! short so the new nearest deadline is honoured.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::clock;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Backward clock jumps beyond this are treated as a rollover and flush
/// every timer.
const ROLLOVER_GAP_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: u64,
    seq: u64,
}

struct TimerState {
    deadline: u64,
    period: u64,
    cb: Option<TimerCallback>,
}

/// Handle to a pending timer. Dropping the handle does not cancel it.
pub struct Timer {
    seq: u64,
    recurring: bool,
    weak_self: Weak<Timer>,
    state: Mutex<TimerState>,
    manager: Weak<TimerManager>,
}

impl Timer {
    /// Remove the timer from its set. Returns false when it already fired
    /// for the last time or was cancelled before.
    pub fn cancel(&self) -> bool {
        let manager = match self.manager.upgrade() {
            Some(m) => m,
            None => return false,
        };
        let mut timers = manager.timers.write().unwrap();
        let mut state = self.state.lock().unwrap();
        if state.cb.is_none() {
            return false;
        }
        state.cb = None;
        timers.remove(&TimerKey {
            deadline: state.deadline,
            seq: self.seq,
        });
        true
    }

    /// Push the deadline to now + period.
    pub fn refresh(&self) -> bool {
        let period = self.state.lock().unwrap().period;
        self.reset(period, true)
    }

    /// Change the period. With `from_now` the next deadline counts from
    /// the current instant, otherwise from the previous start point.
    pub fn reset(&self, period_ms: u64, from_now: bool) -> bool {
        {
            let state = self.state.lock().unwrap();
            if state.period == period_ms && !from_now {
                return true;
            }
        }
        let manager = match self.manager.upgrade() {
            Some(m) => m,
            None => return false,
        };
        let this = match self.weak_self.upgrade() {
            Some(t) => t,
            None => return false,
        };
        let at_front = {
            let mut timers = manager.timers.write().unwrap();
            let mut state = self.state.lock().unwrap();
            if state.cb.is_none() {
                return false;
            }
            let old_key = TimerKey {
                deadline: state.deadline,
                seq: self.seq,
            };
            if timers.remove(&old_key).is_none() {
                return false;
            }
            let start = if from_now {
                clock::monotonic_ms()
            } else {
                state.deadline - state.period
            };
            state.period = period_ms;
            state.deadline = start + period_ms;
            let key = TimerKey {
                deadline: state.deadline,
                seq: self.seq,
            };
            timers.insert(key, this);
            timers.keys().next() == Some(&key)
        };
        if at_front && !manager.tickled.swap(true, Ordering::SeqCst) {
            manager.notify_front();
        }
        true
    }
}

pub struct TimerManager {
    weak_self: Weak<TimerManager>,
    timers: RwLock<BTreeMap<TimerKey, Arc<Timer>>>,
    /// Suppresses repeated front-insert wakeups until the reactor reads
    /// the next timeout again.
    tickled: AtomicBool,
    previous_now: AtomicU64,
    next_seq: AtomicU64,
    front_hook: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new_cyclic(|weak| TimerManager {
            weak_self: weak.clone(),
            timers: RwLock::new(BTreeMap::new()),
            tickled: AtomicBool::new(false),
            previous_now: AtomicU64::new(clock::monotonic_ms()),
            next_seq: AtomicU64::new(0),
            front_hook: RwLock::new(None),
        })
    }

    pub(crate) fn set_front_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *self.front_hook.write().unwrap() = Some(hook);
    }

    /// Register `cb` to run in `period_ms` milliseconds, repeatedly if
    /// `recurring`.
    pub fn add_timer(
        &self,
        period_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        self.add_timer_callback(period_ms, Arc::new(cb), recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only runs
    /// while `witness` is still alive. Ties a timeout to per-call state:
    /// drop the witness and the pending timer degrades to a no-op.
    pub fn add_condition_timer<W: ?Sized + Send + Sync + 'static>(
        &self,
        period_ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        witness: Weak<W>,
        recurring: bool,
    ) -> Arc<Timer> {
        let guarded = move || {
            if witness.upgrade().is_some() {
                cb();
            }
        };
        self.add_timer(period_ms, guarded, recurring)
    }

    fn add_timer_callback(&self, period_ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let deadline = clock::monotonic_ms() + period_ms;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let timer = Arc::new_cyclic(|weak| Timer {
            seq,
            recurring,
            weak_self: weak.clone(),
            state: Mutex::new(TimerState {
                deadline,
                period: period_ms,
                cb: Some(cb),
            }),
            manager: self.weak_self.clone(),
        });
        let key = TimerKey { deadline, seq };
        let at_front = {
            let mut timers = self.timers.write().unwrap();
            timers.insert(key, timer.clone());
            timers.keys().next() == Some(&key)
        };
        if at_front && !self.tickled.swap(true, Ordering::SeqCst) {
            self.notify_front();
        }
        timer
    }

    /// Milliseconds until the nearest deadline; `u64::MAX` when the set
    /// is empty, 0 when something is already due.
    pub fn next_timeout_ms(&self) -> u64 {
        self.tickled.store(false, Ordering::SeqCst);
        let timers = self.timers.read().unwrap();
        match timers.keys().next() {
            None => u64::max_value(),
            Some(key) => {
                let now = clock::monotonic_ms();
                if now >= key.deadline {
                    0
                } else {
                    key.deadline - now
                }
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.timers.read().unwrap().is_empty()
    }

    /// Append every due callback to `out`, re-queueing recurring timers at
    /// `now + period`. A backward clock jump beyond one hour flushes the
    /// whole set.
    pub fn list_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = clock::monotonic_ms();
        {
            if self.timers.read().unwrap().is_empty() {
                return;
            }
        }
        let mut timers = self.timers.write().unwrap();
        let rollover = self.detect_rollover(now);
        match timers.keys().next() {
            Some(key) if rollover || key.deadline <= now => {}
            _ => return,
        }
        let expired = if rollover {
            std::mem::replace(&mut *timers, BTreeMap::new())
        } else {
            let pending = timers.split_off(&TimerKey {
                deadline: now + 1,
                seq: 0,
            });
            std::mem::replace(&mut *timers, pending)
        };
        out.reserve(expired.len());
        for (_, timer) in expired {
            let mut state = timer.state.lock().unwrap();
            let cb = match &state.cb {
                Some(cb) => cb.clone(),
                None => continue,
            };
            out.push(cb);
            if timer.recurring {
                state.deadline = now + state.period;
                let key = TimerKey {
                    deadline: state.deadline,
                    seq: timer.seq,
                };
                drop(state);
                timers.insert(key, timer);
            } else {
                state.cb = None;
            }
        }
    }

    fn detect_rollover(&self, now: u64) -> bool {
        let previous = self.previous_now.swap(now, Ordering::SeqCst);
        now < previous && now + ROLLOVER_GAP_MS < previous
    }

    fn notify_front(&self) {
        if let Some(hook) = self.front_hook.read().unwrap().as_ref() {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;
    use std::time::Duration;

    fn drain(mgr: &TimerManager) -> usize {
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    #[test]
    fn empty_manager_reports_infinity() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timeout_ms(), u64::max_value());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn fires_in_deadline_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (tag, ms) in &[("late", 40u64), ("early", 10), ("mid", 25)] {
            let order = order.clone();
            mgr.add_timer(*ms, move || order.lock().unwrap().push(*tag), false);
        }
        sleep(Duration::from_millis(60));
        assert_eq!(drain(&mgr), 3);
        assert_eq!(*order.lock().unwrap(), vec!["early", "mid", "late"]);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..4 {
            let order = order.clone();
            mgr.add_timer(15, move || order.lock().unwrap().push(tag), false);
        }
        sleep(Duration::from_millis(30));
        drain(&mgr);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn recurring_timer_requeues_itself() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        mgr.add_timer(
            20,
            move || {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        sleep(Duration::from_millis(30));
        assert_eq!(drain(&mgr), 1);
        assert!(mgr.has_timer(), "recurring timer must re-enter the set");
        sleep(Duration::from_millis(30));
        assert_eq!(drain(&mgr), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        let next = mgr.next_timeout_ms();
        assert!(next > 0 && next <= 20, "next timeout {} out of range", next);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let timer = mgr.add_timer(
            10,
            move || {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(timer.cancel());
        assert!(!timer.cancel());
        sleep(Duration::from_millis(20));
        assert_eq!(drain(&mgr), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reset_moves_the_deadline() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(10, || {}, false);
        assert!(timer.reset(200, true));
        sleep(Duration::from_millis(25));
        assert_eq!(drain(&mgr), 0, "reset timer must not fire at old deadline");
        let next = mgr.next_timeout_ms();
        assert!(next > 100, "deadline did not move: {}", next);
    }

    #[test]
    fn condition_timer_needs_a_live_witness() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let witness = Arc::new(());
        let seen = hits.clone();
        mgr.add_condition_timer(
            5,
            move || {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&witness),
            false,
        );

        let dead = Arc::new(());
        let stale = Arc::downgrade(&dead);
        drop(dead);
        let seen = hits.clone();
        mgr.add_condition_timer(
            5,
            move || {
                seen.fetch_add(100, Ordering::SeqCst);
            },
            stale,
            false,
        );

        sleep(Duration::from_millis(15));
        drain(&mgr);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn front_insert_invokes_hook_once() {
        let mgr = TimerManager::new();
        let wakeups = Arc::new(AtomicUsize::new(0));
        let seen = wakeups.clone();
        mgr.set_front_hook(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        mgr.add_timer(1000, || {}, false);
        assert_eq!(wakeups.load(Ordering::SeqCst), 1);
        // Not at the front, and front wakeups stay suppressed until the
        // timeout is re-read.
        mgr.add_timer(2000, || {}, false);
        mgr.add_timer(500, || {}, false);
        assert_eq!(wakeups.load(Ordering::SeqCst), 1);
        mgr.next_timeout_ms();
        mgr.add_timer(100, || {}, false);
        assert_eq!(wakeups.load(Ordering::SeqCst), 2);
    }
}
