use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// One-second buckets kept per backend connection.
pub const STAT_BUCKETS: usize = 5;
/// Newly discovered backends ramp up over this many seconds.
pub const WARM_UP_SECONDS: u64 = 180;
/// Weight handed to items without a meaningful sample yet.
pub const DEFAULT_WEIGHT: i32 = 100;
pub const MIN_WEIGHT: i32 = 1;
pub const MAX_WEIGHT: i32 = 200;
/// Below this many calls in the window an item keeps the default weight.
const MIN_SAMPLE: u64 = 10;

/// Counters for one second of traffic on one connection.
#[derive(Default)]
pub struct BucketStats {
    used_time: AtomicU32,
    total: AtomicU32,
    doing: AtomicU32,
    timeouts: AtomicU32,
    oks: AtomicU32,
    errs: AtomicU32,
}

impl BucketStats {
    pub fn inc_used_time(&self, ms: u32) {
        self.used_time.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn inc_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_doing(&self) {
        self.doing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_doing(&self) {
        self.doing.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_oks(&self) {
        self.oks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errs(&self) {
        self.errs.fetch_add(1, Ordering::Relaxed);
    }

    fn clear(&self) {
        self.used_time.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
        self.doing.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.oks.store(0, Ordering::Relaxed);
        self.errs.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            used_time: self.used_time.load(Ordering::Relaxed) as u64,
            total: self.total.load(Ordering::Relaxed) as u64,
            doing: self.doing.load(Ordering::Relaxed) as u64,
            timeouts: self.timeouts.load(Ordering::Relaxed) as u64,
            oks: self.oks.load(Ordering::Relaxed) as u64,
            errs: self.errs.load(Ordering::Relaxed) as u64,
        }
    }
}

/// Plain-value view of bucket counters, additive across buckets/items.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatSnapshot {
    pub used_time: u64,
    pub total: u64,
    pub doing: u64,
    pub timeouts: u64,
    pub oks: u64,
    pub errs: u64,
}

impl StatSnapshot {
    pub fn add(&mut self, other: &StatSnapshot) {
        self.used_time += other.used_time;
        self.total += other.total;
        self.doing += other.doing;
        self.timeouts += other.timeouts;
        self.oks += other.oks;
        self.errs += other.errs;
    }

    /// Empirical per-bucket health score used for status output; higher
    /// is healthier.
    pub fn score(&self, rate: f64) -> f64 {
        let base = self.total as f64 + 20.0;
        ((self.oks as f64 / (self.used_time as f64 + 1.0)) * 2.0).min(50.0)
            * (1.0 - 4.0 * self.timeouts as f64 / base)
            * (1.0 - self.doing as f64 / base)
            * (1.0 - 10.0 * self.errs as f64 / base)
            * rate
    }
}

/// Sliding window of [`STAT_BUCKETS`] one-second buckets. Rolling into a
/// new second clears every bucket the window skipped over.
pub struct StatsWindow {
    last_update_s: AtomicU64,
    buckets: [BucketStats; STAT_BUCKETS],
}

impl StatsWindow {
    pub fn new(now_s: u64) -> StatsWindow {
        StatsWindow {
            last_update_s: AtomicU64::new(now_s),
            buckets: Default::default(),
        }
    }

    fn roll(&self, now_s: u64) {
        let last = self.last_update_s.load(Ordering::Relaxed);
        if last >= now_s {
            return;
        }
        if self
            .last_update_s
            .compare_exchange(last, now_s, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return; // another caller is rolling this window
        }
        let stale = ((now_s - last) as usize).min(STAT_BUCKETS);
        for i in 1..=stale {
            self.buckets[((last + i as u64) % STAT_BUCKETS as u64) as usize].clear();
        }
    }

    /// The bucket for the given wall-clock second.
    pub fn bucket(&self, now_s: u64) -> &BucketStats {
        self.roll(now_s);
        &self.buckets[(now_s % STAT_BUCKETS as u64) as usize]
    }

    /// Sum over the whole window.
    pub fn total(&self, now_s: u64) -> StatSnapshot {
        self.roll(now_s);
        let mut sum = StatSnapshot::default();
        for bucket in &self.buckets {
            sum.add(&bucket.snapshot());
        }
        sum
    }

    /// Recency-weighted health score: each second into the past loses a
    /// tenth of its influence.
    pub fn weighted_score(&self, now_s: u64) -> f64 {
        self.roll(now_s);
        let mut score = 0.0;
        for age in 1..STAT_BUCKETS {
            let bucket = &self.buckets[((now_s - age as u64) % STAT_BUCKETS as u64) as usize];
            score += bucket.snapshot().score(1.0 - 0.1 * age as f64);
        }
        score
    }
}

/// Adaptive weight for the fair strategy.
///
/// An item's window is compared with the whole pool: relative cost,
/// error rate, timeout rate and in-flight pressure each attenuate the
/// ceiling of 200, and backends younger than [`WARM_UP_SECONDS`] are
/// additionally throttled to at most a tenth of their weight. The result
/// is clamped into `[1, 200]`; items with fewer than 10 calls in the
/// window stay at the default 100.
pub fn fair_weight(
    item: &StatSnapshot,
    pool: &StatSnapshot,
    discovery_time_s: u64,
    now_s: u64,
) -> i32 {
    if pool.total == 0 {
        return DEFAULT_WEIGHT;
    }

    let age = now_s.saturating_sub(discovery_time_s);
    let time_factor = if age < WARM_UP_SECONDS {
        (age as f64 / WARM_UP_SECONDS as f64).min(0.1)
    } else {
        1.0
    };

    if item.total < MIN_SAMPLE {
        return DEFAULT_WEIGHT;
    }

    let pool_avg_cost = pool.used_time as f64 / pool.total as f64;
    let cost_factor = if pool_avg_cost > 0.0 {
        let relative = (item.used_time as f64 / item.total as f64) / pool_avg_cost;
        2.0 - relative.min(1.9)
    } else {
        1.0
    };
    let err_factor = 1.0 - (5.0 * item.errs as f64 / item.total as f64).min(0.9);
    let timeout_factor = 1.0 - (2.5 * item.timeouts as f64 / item.total as f64).min(0.9);
    let doing_factor = 1.0 - (item.doing as f64 / item.total as f64).min(0.9);

    let raw = 200.0 * cost_factor * err_factor * timeout_factor * doing_factor * time_factor;
    (raw as i32).max(MIN_WEIGHT).min(MAX_WEIGHT)
}
