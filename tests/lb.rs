//! Service-discovery load balancing, end to end.
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use filament::error::Error;
use filament::lb::sd::{SdLoadBalance, ServiceItemInfo, ServiceSet, StaticServiceDiscovery};
use filament::lb::{LbStream, Strategy};
use filament::reactor::IoManager;

struct TestStream {
    id: u64,
    connected: AtomicBool,
}

impl TestStream {
    fn new(id: u64) -> Arc<TestStream> {
        Arc::new(TestStream {
            id,
            connected: AtomicBool::new(true),
        })
    }
}

impl LbStream for TestStream {
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

fn service_set(ids: &[u64]) -> ServiceSet {
    ids.iter()
        .map(|id| {
            let mut info = ServiceItemInfo::new(*id, "127.0.0.1", 9000 + *id as u16);
            info.data.insert("weight".to_string(), "1".to_string());
            (*id, Arc::new(info))
        })
        .collect()
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

struct Fixture {
    iom: Arc<IoManager>,
    sd: Arc<StaticServiceDiscovery>,
    slb: Arc<SdLoadBalance>,
    streams: Arc<Mutex<Vec<Arc<TestStream>>>>,
}

fn fixture(strategy_name: &str) -> Fixture {
    let iom = IoManager::new(1, false, "lb-worker").unwrap();
    let sd = StaticServiceDiscovery::new();
    let slb = SdLoadBalance::new(sd.clone(), iom.clone());

    let mut conf = HashMap::new();
    let mut services = HashMap::new();
    services.insert("api".to_string(), strategy_name.to_string());
    conf.insert("orders".to_string(), services);
    slb.init_conf(conf);

    let streams = Arc::new(Mutex::new(Vec::new()));
    let made = streams.clone();
    slb.set_stream_factory(Box::new(move |_domain, _service, info| {
        let stream = TestStream::new(info.id);
        made.lock().unwrap().push(stream.clone());
        Some(stream as Arc<dyn LbStream>)
    }));
    slb.start();
    Fixture { iom, sd, slb, streams }
}

#[test]
fn discovered_backends_become_reachable() {
    let fx = fixture("round_robin");
    fx.sd.apply("orders", "api", service_set(&[1, 2]));

    let lb = fx.slb.get("orders", "api", false).unwrap();
    assert_eq!(lb.strategy(), Strategy::RoundRobin);
    assert_eq!(lb.item_count(), 2);

    let conn = fx.slb.get_conn_as::<TestStream>("orders", "api", Some(0)).unwrap();
    assert!(conn.is_connected());
    assert!(conn.id == 1 || conn.id == 2);

    fx.slb.stop();
    fx.iom.stop().unwrap();
}

#[test]
fn unknown_service_is_no_service() {
    let fx = fixture("round_robin");
    match fx.slb.get_conn_as::<TestStream>("billing", "api", Some(0)) {
        Err(Error::NoService) => {}
        other => panic!("expected NoService, got {:?}", other.map(|_| ())),
    }
    fx.slb.stop();
    fx.iom.stop().unwrap();
}

#[test]
fn empty_membership_is_no_connection() {
    let fx = fixture("round_robin");
    fx.sd.apply("orders", "api", service_set(&[5]));
    fx.sd.apply("orders", "api", service_set(&[]));
    match fx.slb.get_conn_as::<TestStream>("orders", "api", Some(0)) {
        Err(Error::NoConnection) => {}
        other => panic!("expected NoConnection, got {:?}", other.map(|_| ())),
    }
    fx.slb.stop();
    fx.iom.stop().unwrap();
}

#[test]
fn removed_backends_are_closed_asynchronously() {
    let fx = fixture("round_robin");
    fx.sd.apply("orders", "api", service_set(&[1, 2]));
    assert!(wait_until(Duration::from_secs(1), || {
        fx.streams.lock().unwrap().len() == 2
    }));

    fx.sd.apply("orders", "api", service_set(&[2]));
    let removed = fx
        .streams
        .lock()
        .unwrap()
        .iter()
        .find(|s| s.id == 1)
        .cloned()
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || !removed.is_connected()),
        "removed backend's stream must be closed on the worker"
    );

    let survivor = fx.slb.get_conn_as::<TestStream>("orders", "api", Some(0)).unwrap();
    assert_eq!(survivor.id, 2);

    fx.slb.stop();
    fx.iom.stop().unwrap();
}

#[test]
fn weighted_config_builds_a_weighted_balancer() {
    let fx = fixture("weight");
    let mut set = ServiceSet::new();
    for (id, weight) in &[(10u64, "1"), (11, "3")] {
        let mut info = ServiceItemInfo::new(*id, "127.0.0.1", 9100);
        info.data.insert("weight".to_string(), (*weight).to_string());
        set.insert(*id, Arc::new(info));
    }
    fx.sd.apply("orders", "api", set);

    let lb = fx.slb.get("orders", "api", false).unwrap();
    assert_eq!(lb.strategy(), Strategy::Weighted);
    // Deterministic weighted selection: ids sorted, prefix sums [1, 4].
    let picks: Vec<u64> = (0..8u64)
        .map(|seed| lb.get(Some(seed)).unwrap().id())
        .collect();
    assert_eq!(picks, vec![10, 11, 11, 11, 10, 11, 11, 11]);

    fx.slb.stop();
    fx.iom.stop().unwrap();
}

#[test]
fn status_string_reports_every_backend() {
    let fx = fixture("fair");
    fx.sd.apply("orders", "api", service_set(&[1, 2, 3]));
    let status = fx.slb.status_string();
    assert!(status.contains("orders/api:"));
    assert_eq!(status.matches("[item id=").count(), 3);
    fx.slb.stop();
    fx.iom.stop().unwrap();
}
