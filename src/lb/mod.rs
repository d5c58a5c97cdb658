//! Connection load balancing.
//!
//! A [`LoadBalancer`] owns a set of [`LbItem`]s (one outbound stream
//! plus its sliding-window statistics each) and picks one per request
//! by round-robin, static weights, or adaptively recomputed fair
//! weights. [`sd::SdLoadBalance`] keeps one balancer per
//! (domain, service) pair in sync with a service-discovery feed.
pub mod sd;
pub mod stats;

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;

use crate::clock;
use crate::error::Error;
use stats::{fair_weight, StatSnapshot, StatsWindow};

/// Sentinel error codes surfaced to callers that speak numeric errors.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum LbErrorCode {
    NoService = -101,
    NoConnection = -102,
}

impl LbErrorCode {
    pub fn from_code(code: i32) -> Option<LbErrorCode> {
        num_traits::FromPrimitive::from_i32(code)
    }

    pub fn as_error(self) -> Error {
        match self {
            LbErrorCode::NoService => Error::NoService,
            LbErrorCode::NoConnection => Error::NoConnection,
        }
    }
}

/// Selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Strategy {
    RoundRobin = 1,
    Weighted = 2,
    Fair = 3,
}

impl Strategy {
    pub fn from_name(name: &str) -> Option<Strategy> {
        match name {
            "round_robin" => Some(Strategy::RoundRobin),
            "weight" => Some(Strategy::Weighted),
            "fair" => Some(Strategy::Fair),
            _ => None,
        }
    }
}

/// An outbound connection usable by the balancer. Implementations wrap
/// whatever stream type the application speaks; `as_any_arc` enables the
/// typed recovery in [`sd::SdLoadBalance::get_conn_as`].
pub trait LbStream: Send + Sync {
    fn is_connected(&self) -> bool;
    fn close(&self);
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// One backend: an id from service discovery, the stream, statistics and
/// the current selection weight.
pub struct LbItem {
    id: u64,
    stream: RwLock<Option<Arc<dyn LbStream>>>,
    stats: StatsWindow,
    weight: AtomicI32,
    discovery_time_s: u64,
}

impl LbItem {
    pub fn new(id: u64, stream: Option<Arc<dyn LbStream>>, weight: i32) -> Arc<LbItem> {
        Arc::new(LbItem {
            id,
            stream: RwLock::new(stream),
            stats: StatsWindow::new(clock::realtime_s()),
            weight: AtomicI32::new(weight),
            discovery_time_s: clock::realtime_s(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn weight(&self) -> i32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: i32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    pub fn discovery_time_s(&self) -> u64 {
        self.discovery_time_s
    }

    pub fn stats(&self) -> &StatsWindow {
        &self.stats
    }

    pub fn stream(&self) -> Option<Arc<dyn LbStream>> {
        self.stream.read().unwrap().clone()
    }

    pub fn set_stream(&self, stream: Option<Arc<dyn LbStream>>) {
        *self.stream.write().unwrap() = stream;
    }

    /// Downcast the stream to its concrete type.
    pub fn stream_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let stream = self.stream()?;
        stream.as_any_arc().downcast::<T>().ok()
    }

    /// Connected and usable.
    pub fn is_valid(&self) -> bool {
        self.stream().map_or(false, |s| s.is_connected())
    }

    pub(crate) fn close_stream(&self) {
        if let Some(stream) = self.stream() {
            stream.close();
        }
    }

    pub fn status_string(&self) -> String {
        let now = clock::realtime_s();
        let total = self.stats.total(now);
        format!(
            "[item id={} weight={} connected={} total={} oks={} errs={} timeouts={} avg_used={:.2} score={:.2}]",
            self.id,
            self.weight(),
            self.is_valid(),
            total.total,
            total.oks,
            total.errs,
            total.timeouts,
            if total.oks > 0 {
                total.used_time as f64 / total.oks as f64
            } else {
                0.0
            },
            self.stats.weighted_score(now),
        )
    }
}

struct LbInner {
    datas: HashMap<u64, Arc<LbItem>>,
    /// Valid items snapshotted at the last rebuild, in selection order.
    items: Vec<Arc<LbItem>>,
    /// Weight prefix sums parallel to `items` (weighted/fair only).
    prefix: Vec<i64>,
}

/// Item set plus one selection strategy.
///
/// Selection runs against a snapshot rebuilt on membership changes and
/// periodically ([`check_rebuild`](Self::check_rebuild)) so the hot path
/// is a read lock, a modulo and at most one scan.
pub struct LoadBalancer {
    strategy: Strategy,
    inner: RwLock<LbInner>,
    last_rebuild_ms: AtomicU64,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Arc<LoadBalancer> {
        Arc::new(LoadBalancer {
            strategy,
            inner: RwLock::new(LbInner {
                datas: HashMap::new(),
                items: Vec::new(),
                prefix: Vec::new(),
            }),
            last_rebuild_ms: AtomicU64::new(0),
        })
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn add(&self, item: Arc<LbItem>) {
        let mut inner = self.inner.write().unwrap();
        inner.datas.insert(item.id(), item);
        rebuild(self.strategy, &mut inner);
    }

    pub fn del(&self, id: u64) -> Option<Arc<LbItem>> {
        let mut inner = self.inner.write().unwrap();
        let removed = inner.datas.remove(&id);
        rebuild(self.strategy, &mut inner);
        removed
    }

    pub fn set(&self, items: Vec<Arc<LbItem>>) {
        let mut inner = self.inner.write().unwrap();
        inner.datas.clear();
        for item in items {
            inner.datas.insert(item.id(), item);
        }
        rebuild(self.strategy, &mut inner);
    }

    /// Apply a discovery diff: insert `adds`, remove `del_ids`, returning
    /// the removed items so the caller can close their streams.
    pub fn update(
        &self,
        adds: HashMap<u64, Arc<LbItem>>,
        del_ids: &[u64],
    ) -> Vec<Arc<LbItem>> {
        let mut inner = self.inner.write().unwrap();
        let mut removed = Vec::new();
        for id in del_ids {
            if let Some(item) = inner.datas.remove(id) {
                removed.push(item);
            }
        }
        for (id, item) in adds {
            inner.datas.insert(id, item);
        }
        rebuild(self.strategy, &mut inner);
        removed
    }

    pub fn get_by_id(&self, id: u64) -> Option<Arc<LbItem>> {
        self.inner.read().unwrap().datas.get(&id).cloned()
    }

    pub fn item_count(&self) -> usize {
        self.inner.read().unwrap().datas.len()
    }

    /// Pick a backend. `seed` makes the choice deterministic
    /// (`seed % total_weight` for the weighted family, `seed % n` for
    /// round-robin); `None` draws a random seed.
    pub fn get(&self, seed: Option<u64>) -> Option<Arc<LbItem>> {
        let inner = self.inner.read().unwrap();
        if inner.items.is_empty() {
            return None;
        }
        let seed = seed.unwrap_or_else(|| rand::thread_rng().gen());
        let start = match self.strategy {
            Strategy::RoundRobin => (seed % inner.items.len() as u64) as usize,
            Strategy::Weighted | Strategy::Fair => {
                let total = *inner.prefix.last()?;
                if total <= 0 {
                    return None;
                }
                let point = (seed % total as u64) as i64;
                match inner.prefix.binary_search(&point) {
                    // prefix sums are exclusive upper bounds; an exact hit
                    // belongs to the next slot
                    Ok(i) => i + 1,
                    Err(i) => i,
                }
            }
        };
        for offset in 0..inner.items.len() {
            let item = &inner.items[(start + offset) % inner.items.len()];
            if item.is_valid() {
                return Some(item.clone());
            }
        }
        None
    }

    /// Rebuild the selection snapshot now.
    pub fn rebuild(&self) {
        let mut inner = self.inner.write().unwrap();
        rebuild(self.strategy, &mut inner);
        self.last_rebuild_ms
            .store(clock::monotonic_ms(), Ordering::Relaxed);
    }

    /// Rebuild when the last one is older than `interval_ms`; the
    /// periodic refresh timer funnels through here.
    pub fn check_rebuild(&self, interval_ms: u64) {
        let now = clock::monotonic_ms();
        if now.saturating_sub(self.last_rebuild_ms.load(Ordering::Relaxed)) > interval_ms {
            self.rebuild();
        }
    }

    pub fn status_string(&self, prefix: &str) -> String {
        let items: Vec<Arc<LbItem>> = {
            let inner = self.inner.read().unwrap();
            inner.datas.values().cloned().collect()
        };
        let mut out = String::new();
        for item in items {
            out.push_str(prefix);
            out.push_str(&item.status_string());
            out.push('\n');
        }
        out
    }
}

fn rebuild(strategy: Strategy, inner: &mut LbInner) {
    let mut items: Vec<Arc<LbItem>> = inner
        .datas
        .values()
        .filter(|item| item.is_valid())
        .cloned()
        .collect();
    items.sort_by_key(|item| item.id());

    if strategy == Strategy::Fair {
        let now = clock::realtime_s();
        let mut pool = StatSnapshot::default();
        let snapshots: Vec<StatSnapshot> =
            items.iter().map(|item| item.stats().total(now)).collect();
        for snapshot in &snapshots {
            pool.add(snapshot);
        }
        for (item, snapshot) in items.iter().zip(&snapshots) {
            item.set_weight(fair_weight(snapshot, &pool, item.discovery_time_s(), now));
        }
    }

    inner.prefix.clear();
    if strategy != Strategy::RoundRobin {
        let mut total = 0i64;
        for item in &items {
            total += i64::from(item.weight().max(0));
            inner.prefix.push(total);
        }
    }
    inner.items = items;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeStream {
        connected: std::sync::atomic::AtomicBool,
    }

    impl FakeStream {
        fn new(connected: bool) -> Arc<FakeStream> {
            Arc::new(FakeStream {
                connected: std::sync::atomic::AtomicBool::new(connected),
            })
        }
    }

    impl LbStream for FakeStream {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn item(id: u64, weight: i32) -> Arc<LbItem> {
        LbItem::new(id, Some(FakeStream::new(true) as Arc<dyn LbStream>), weight)
    }

    #[test]
    fn round_robin_scans_from_the_seed() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        for id in 0..3 {
            lb.add(item(id, 1));
        }
        for seed in 0..9u64 {
            let picked = lb.get(Some(seed)).unwrap();
            assert_eq!(picked.id(), seed % 3);
        }
    }

    #[test]
    fn weighted_selection_is_deterministic() {
        let lb = LoadBalancer::new(Strategy::Weighted);
        lb.add(item(0, 1)); // A
        lb.add(item(1, 3)); // B
        let picks: Vec<u64> = (0..8u64)
            .map(|seed| lb.get(Some(seed)).unwrap().id())
            .collect();
        assert_eq!(picks, vec![0, 1, 1, 1, 0, 1, 1, 1]);
    }

    #[test]
    fn disconnected_items_are_skipped() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        let a = item(0, 1);
        let b = item(1, 1);
        lb.add(a.clone());
        lb.add(b.clone());
        a.close_stream();
        for seed in 0..4u64 {
            assert_eq!(lb.get(Some(seed)).unwrap().id(), 1);
        }
        b.close_stream();
        assert!(lb.get(Some(0)).is_none());
    }

    #[test]
    fn empty_balancer_returns_none() {
        let lb = LoadBalancer::new(Strategy::Weighted);
        assert!(lb.get(Some(0)).is_none());
        assert!(lb.get(None).is_none());
    }

    #[test]
    fn update_returns_removed_items() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        lb.add(item(7, 1));
        let mut adds = HashMap::new();
        adds.insert(8, item(8, 1));
        let removed = lb.update(adds, &[7]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id(), 7);
        assert!(lb.get_by_id(7).is_none());
        assert!(lb.get_by_id(8).is_some());
    }

    #[test]
    fn fair_rebuild_assigns_clamped_weights() {
        let lb = LoadBalancer::new(Strategy::Fair);
        let fast = item(0, 0);
        let slow = item(1, 0);
        let now = clock::realtime_s();
        for _ in 0..100 {
            fast.stats().bucket(now).inc_total();
            fast.stats().bucket(now).inc_oks();
            fast.stats().bucket(now).inc_used_time(1);
            slow.stats().bucket(now).inc_total();
            slow.stats().bucket(now).inc_oks();
            slow.stats().bucket(now).inc_used_time(50);
        }
        lb.add(fast.clone());
        lb.add(slow.clone());
        lb.rebuild();
        for it in &[&fast, &slow] {
            let w = it.weight();
            assert!(w >= stats::MIN_WEIGHT && w <= stats::MAX_WEIGHT);
        }
        // Warm-up throttling applies to both (fresh discovery time), but
        // relative order must favour the faster backend.
        assert!(fast.weight() >= slow.weight());
    }

    #[test]
    fn stream_downcast_recovers_the_concrete_type() {
        let stream = FakeStream::new(true);
        let it = LbItem::new(1, Some(stream as Arc<dyn LbStream>), 1);
        assert!(it.stream_as::<FakeStream>().is_some());
        struct Other;
        assert!(it.stream_as::<Other>().is_none());
    }

    #[test]
    fn error_codes_round_trip() {
        assert_eq!(LbErrorCode::from_code(-101), Some(LbErrorCode::NoService));
        assert_eq!(LbErrorCode::from_code(-102), Some(LbErrorCode::NoConnection));
        assert_eq!(LbErrorCode::from_code(0), None);
    }
}
