//! Typed runtime configuration variables.
//!
//! A [`ConfigVar`] is a named, typed value living in a process-wide
//! registry. Subsystems look their tunables up once
//! (`Config::lookup("fiber.stack_size", 131072, ..)`) and either read the
//! current value on use or register a listener to cache updates.
//! [`Config::load`] applies a `serde_json` settings tree; where the values
//! come from (file, environment, service) is up to the embedding
//! application.
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, error};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// A single named configuration value.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ConfigVar<T> {
    fn new(name: &str, default: T, description: &str) -> Self {
        ConfigVar {
            name: name.to_string(),
            description: description.to_string(),
            value: RwLock::new(default),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn value(&self) -> T {
        self.value.read().unwrap().clone()
    }

    /// Replace the value. Listeners run with (old, new) when it changed.
    pub fn set(&self, new: T) {
        let old = {
            let mut slot = self.value.write().unwrap();
            if *slot == new {
                return;
            }
            std::mem::replace(&mut *slot, new.clone())
        };
        for listener in self.listeners.lock().unwrap().iter() {
            listener(&old, &new);
        }
    }

    /// Observe future changes of this variable.
    pub fn add_listener(&self, listener: impl Fn(&T, &T) + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }
}

trait AnyVar: Send + Sync {
    fn apply_json(&self, value: &Value) -> bool;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> AnyVar for ConfigVar<T>
where
    T: Clone + PartialEq + DeserializeOwned + Send + Sync + 'static,
{
    fn apply_json(&self, value: &Value) -> bool {
        match serde_json::from_value::<T>(value.clone()) {
            Ok(v) => {
                self.set(v);
                true
            }
            Err(e) => {
                error!("config {}: cannot parse {}: {}", self.name, value, e);
                false
            }
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<String, Arc<dyn AnyVar>>> = RwLock::new(HashMap::new());
}

/// Process-wide variable registry.
pub struct Config;

impl Config {
    /// Fetch the variable `name`, registering it with `default` on first
    /// lookup. A repeated lookup with a different type logs an error and
    /// returns a detached variable holding the default.
    pub fn lookup<T>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>>
    where
        T: Clone + PartialEq + DeserializeOwned + Send + Sync + 'static,
    {
        let mut registry = REGISTRY.write().unwrap();
        if let Some(existing) = registry.get(name) {
            match existing.clone().as_any_arc().downcast::<ConfigVar<T>>() {
                Ok(var) => return var,
                Err(_) => {
                    error!("config {}: looked up with a mismatched type", name);
                    return Arc::new(ConfigVar::new(name, default, description));
                }
            }
        }
        let var = Arc::new(ConfigVar::new(name, default, description));
        registry.insert(name.to_string(), var.clone());
        var
    }

    /// Apply a settings tree. Nested objects flatten into dotted names
    /// (`{"fiber": {"stack_size": 65536}}` targets `fiber.stack_size`);
    /// unknown names are ignored with a debug log so partial trees load.
    pub fn load(settings: &Value) {
        let mut flat = Vec::new();
        flatten("", settings, &mut flat);
        let registry = REGISTRY.read().unwrap();
        for (name, value) in flat {
            match registry.get(&name) {
                Some(var) => {
                    var.apply_json(value);
                }
                None => debug!("config {}: no such variable, skipped", name),
            }
        }
    }
}

fn flatten<'v>(prefix: &str, value: &'v Value, out: &mut Vec<(String, &'v Value)>) {
    match value {
        Value::Object(map) => {
            for (key, sub) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&name, sub, out);
            }
        }
        other => out.push((prefix.to_string(), other)),
    }
}
