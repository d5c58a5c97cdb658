//! Service-discovery-driven load balancing.
//!
//! [`SdLoadBalance`] subscribes to a [`ServiceDiscovery`] feed and keeps
//! one [`LoadBalancer`] per (domain, service) pair: backends that appear
//! get a stream from the user-supplied factory and join the balancer,
//! backends that disappear leave it and have their stream closed
//! asynchronously on the worker. A periodic timer rebuilds the selection
//! snapshots so fair weights track fresh statistics.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{error, info};

use super::{LbItem, LbStream, LoadBalancer, Strategy};
use crate::error::{Error, Result};
use crate::reactor::IoManager;
use crate::scheduler::Task;
use crate::timer::Timer;

/// Selection snapshots rebuild at most this often.
const REFRESH_INTERVAL_MS: u64 = 500;

/// One discovered backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceItemInfo {
    pub id: u64,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl ServiceItemInfo {
    pub fn new(id: u64, host: &str, port: u16) -> ServiceItemInfo {
        ServiceItemInfo {
            id,
            host: host.to_string(),
            port,
            data: HashMap::new(),
        }
    }

    /// Static weight hint carried in the discovery payload.
    pub fn weight(&self) -> i32 {
        self.data
            .get("weight")
            .and_then(|w| w.parse().ok())
            .unwrap_or(10_000)
    }
}

pub type ServiceSet = HashMap<u64, Arc<ServiceItemInfo>>;
pub type ServiceCallback =
    Box<dyn Fn(&str, &str, &ServiceSet, &ServiceSet) + Send + Sync>;

/// A feed of (domain, service) membership diffs.
pub trait ServiceDiscovery: Send + Sync {
    fn start(&self);
    fn stop(&self);
    /// Which services the discovery should watch.
    fn set_query_servers(&self, servers: HashMap<String, HashSet<String>>);
    /// Observe membership changes; called with (domain, service, old, new).
    fn add_service_callback(&self, cb: ServiceCallback);
}

/// In-memory discovery source: tests and static deployments push
/// membership sets in by hand.
pub struct StaticServiceDiscovery {
    services: RwLock<HashMap<(String, String), ServiceSet>>,
    callbacks: RwLock<Vec<ServiceCallback>>,
    queries: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticServiceDiscovery {
    pub fn new() -> Arc<StaticServiceDiscovery> {
        Arc::new(StaticServiceDiscovery {
            services: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            queries: RwLock::new(HashMap::new()),
        })
    }

    /// Replace the membership of one service and notify subscribers.
    pub fn apply(&self, domain: &str, service: &str, new_set: ServiceSet) {
        let old_set = {
            let mut services = self.services.write().unwrap();
            services
                .insert((domain.to_string(), service.to_string()), new_set.clone())
                .unwrap_or_default()
        };
        for cb in self.callbacks.read().unwrap().iter() {
            cb(domain, service, &old_set, &new_set);
        }
    }
}

impl ServiceDiscovery for StaticServiceDiscovery {
    fn start(&self) {}

    fn stop(&self) {}

    fn set_query_servers(&self, servers: HashMap<String, HashSet<String>>) {
        *self.queries.write().unwrap() = servers;
    }

    fn add_service_callback(&self, cb: ServiceCallback) {
        self.callbacks.write().unwrap().push(cb);
    }
}

/// Creates the outbound stream for a newly discovered backend. `None`
/// skips the backend (it retries on the next membership change).
pub type StreamFactory =
    Box<dyn Fn(&str, &str, &Arc<ServiceItemInfo>) -> Option<Arc<dyn LbStream>> + Send + Sync>;

pub struct SdLoadBalance {
    weak_self: Weak<SdLoadBalance>,
    sd: Arc<dyn ServiceDiscovery>,
    worker: Arc<IoManager>,
    // domain -> service -> balancer
    datas: RwLock<HashMap<String, HashMap<String, Arc<LoadBalancer>>>>,
    types: RwLock<HashMap<String, HashMap<String, Strategy>>>,
    factory: RwLock<Option<StreamFactory>>,
    refresh_timer: Mutex<Option<Arc<Timer>>>,
}

impl SdLoadBalance {
    pub fn new(sd: Arc<dyn ServiceDiscovery>, worker: Arc<IoManager>) -> Arc<SdLoadBalance> {
        let this = Arc::new_cyclic(|weak: &Weak<SdLoadBalance>| SdLoadBalance {
            weak_self: weak.clone(),
            sd: sd.clone(),
            worker,
            datas: RwLock::new(HashMap::new()),
            types: RwLock::new(HashMap::new()),
            factory: RwLock::new(None),
            refresh_timer: Mutex::new(None),
        });
        let weak = this.weak_self.clone();
        sd.add_service_callback(Box::new(move |domain, service, old_set, new_set| {
            if let Some(this) = weak.upgrade() {
                this.on_service_change(domain, service, old_set, new_set);
            }
        }));
        this
    }

    pub fn set_stream_factory(&self, factory: StreamFactory) {
        *self.factory.write().unwrap() = Some(factory);
    }

    /// Configure strategies from a domain -> service -> strategy-name
    /// map; unknown names fall back to fair. The service list doubles as
    /// the discovery query set.
    pub fn init_conf(&self, confs: HashMap<String, HashMap<String, String>>) {
        let mut types: HashMap<String, HashMap<String, Strategy>> = HashMap::new();
        let mut queries: HashMap<String, HashSet<String>> = HashMap::new();
        for (domain, services) in &confs {
            for (service, strategy_name) in services {
                let strategy =
                    Strategy::from_name(strategy_name).unwrap_or(Strategy::Fair);
                types
                    .entry(domain.clone())
                    .or_insert_with(HashMap::new)
                    .insert(service.clone(), strategy);
                queries
                    .entry(domain.clone())
                    .or_insert_with(HashSet::new)
                    .insert(service.clone());
            }
        }
        self.sd.set_query_servers(queries);
        *self.types.write().unwrap() = types;
    }

    /// Start discovery and the periodic snapshot refresh.
    pub fn start(&self) {
        let mut timer = self.refresh_timer.lock().unwrap();
        if timer.is_some() {
            return;
        }
        let weak = self.weak_self.clone();
        *timer = Some(self.worker.add_timer(
            REFRESH_INTERVAL_MS,
            move || {
                if let Some(this) = weak.upgrade() {
                    this.refresh();
                }
            },
            true,
        ));
        self.sd.start();
        info!("sd load balance started");
    }

    pub fn stop(&self) {
        let mut timer = self.refresh_timer.lock().unwrap();
        if let Some(timer) = timer.take() {
            timer.cancel();
        }
        self.sd.stop();
        info!("sd load balance stopped");
    }

    /// The balancer for (domain, service); `auto_create` builds one with
    /// the configured strategy when missing.
    pub fn get(&self, domain: &str, service: &str, auto_create: bool) -> Option<Arc<LoadBalancer>> {
        {
            let datas = self.datas.read().unwrap();
            if let Some(lb) = datas.get(domain).and_then(|d| d.get(service)) {
                return Some(lb.clone());
            }
        }
        if !auto_create {
            return None;
        }
        let strategy = self.strategy_for(domain, service)?;
        let mut datas = self.datas.write().unwrap();
        Some(
            datas
                .entry(domain.to_string())
                .or_insert_with(HashMap::new)
                .entry(service.to_string())
                .or_insert_with(|| LoadBalancer::new(strategy))
                .clone(),
        )
    }

    /// Pick a connection for (domain, service) and recover its concrete
    /// stream type. [`Error::NoService`] when nothing is configured,
    /// [`Error::NoConnection`] when no healthy backend (or a backend of
    /// another type) is available.
    pub fn get_conn_as<T: Send + Sync + 'static>(
        &self,
        domain: &str,
        service: &str,
        seed: Option<u64>,
    ) -> Result<Arc<T>> {
        let lb = self.get(domain, service, false).ok_or(Error::NoService)?;
        let item = lb.get(seed).ok_or(Error::NoConnection)?;
        item.stream_as::<T>().ok_or(Error::NoConnection)
    }

    pub fn status_string(&self) -> String {
        let snapshot: Vec<(String, String, Arc<LoadBalancer>)> = {
            let datas = self.datas.read().unwrap();
            datas
                .iter()
                .flat_map(|(domain, services)| {
                    services.iter().map(move |(service, lb)| {
                        (domain.clone(), service.clone(), lb.clone())
                    })
                })
                .collect()
        };
        let mut out = String::new();
        for (domain, service, lb) in snapshot {
            out.push_str(&format!("{}/{}:\n", domain, service));
            out.push_str(&lb.status_string("\t"));
        }
        out
    }

    fn strategy_for(&self, domain: &str, service: &str) -> Option<Strategy> {
        let types = self.types.read().unwrap();
        let services = types.get(domain)?;
        services
            .get(service)
            .or_else(|| services.get("all"))
            .copied()
    }

    fn refresh(&self) {
        let snapshot: Vec<Arc<LoadBalancer>> = {
            let datas = self.datas.read().unwrap();
            datas
                .values()
                .flat_map(|services| services.values().cloned())
                .collect()
        };
        for lb in snapshot {
            lb.check_rebuild(REFRESH_INTERVAL_MS);
        }
    }

    fn on_service_change(
        &self,
        domain: &str,
        service: &str,
        old_set: &ServiceSet,
        new_set: &ServiceSet,
    ) {
        if self.strategy_for(domain, service).is_none() {
            return;
        }

        let del_ids: Vec<u64> = old_set
            .keys()
            .filter(|id| !new_set.contains_key(id))
            .copied()
            .collect();

        let factory = self.factory.read().unwrap();
        let mut adds = HashMap::new();
        for (id, info) in new_set {
            if old_set.contains_key(id) {
                continue;
            }
            let stream = match factory.as_ref().and_then(|f| f(domain, service, info)) {
                Some(stream) => stream,
                None => {
                    error!(
                        "sd load balance: no stream for {}/{} instance {}:{} (id={})",
                        domain, service, info.host, info.port, id
                    );
                    continue;
                }
            };
            adds.insert(*id, LbItem::new(*id, Some(stream), info.weight()));
        }

        if adds.is_empty() && del_ids.is_empty() {
            return;
        }
        let lb = match self.get(domain, service, true) {
            Some(lb) => lb,
            None => return,
        };
        let removed = lb.update(adds, &del_ids);
        for item in removed {
            let task = Task::call(move || item.close_stream());
            if let Err(e) = self.worker.schedule(task) {
                error!("sd load balance: close dispatch failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_item_weight_parses_from_data() {
        let mut info = ServiceItemInfo::new(1, "10.0.0.1", 8000);
        assert_eq!(info.weight(), 10_000);
        info.data.insert("weight".to_string(), "25".to_string());
        assert_eq!(info.weight(), 25);
        info.data.insert("weight".to_string(), "junk".to_string());
        assert_eq!(info.weight(), 10_000);
    }

    #[test]
    fn service_item_serializes() {
        let mut info = ServiceItemInfo::new(7, "backend-1", 9090);
        info.data.insert("zone".to_string(), "eu-1".to_string());
        let json = serde_json::to_string(&info).unwrap();
        let back: ServiceItemInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 7);
        assert_eq!(back.host, "backend-1");
        assert_eq!(back.data.get("zone").map(String::as_str), Some("eu-1"));
    }

    #[test]
    fn static_discovery_diffs_old_against_new() {
        let sd = StaticServiceDiscovery::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        sd.add_service_callback(Box::new(move |domain, service, old, new| {
            log.lock()
                .unwrap()
                .push((domain.to_string(), service.to_string(), old.len(), new.len()));
        }));

        let mut set = ServiceSet::new();
        set.insert(1, Arc::new(ServiceItemInfo::new(1, "a", 1)));
        sd.apply("orders", "api", set.clone());
        set.insert(2, Arc::new(ServiceItemInfo::new(2, "b", 2)));
        sd.apply("orders", "api", set);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("orders".to_string(), "api".to_string(), 0, 1));
        assert_eq!(seen[1], ("orders".to_string(), "api".to_string(), 1, 2));
    }
}
