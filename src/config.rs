//! Typed configuration store.
//!
//! Tunables live in named [`ConfigVar`]s collected in a process-wide
//! registry. A variable carries a default, a description and a set of
//! change listeners which fire with the old and the new value whenever the
//! value actually changes. Bulk loading takes a JSON document whose dotted
//! keys are matched against registered variable names; unknown keys are
//! ignored.
//!
//! The runtime itself reads only a handful of variables (fiber stack size,
//! TCP connect timeout, server read timeout, HTTP caps); everything else
//! is for the applications built on top.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A single named typed configuration variable.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: RwLock<HashMap<u64, Listener<T>>>,
    listener_key: AtomicU64,
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn new(name: String, default: T, description: String) -> Self {
        Self {
            name,
            description,
            value: RwLock::new(default),
            listeners: RwLock::new(HashMap::new()),
            listener_key: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current value (cloned out from under the lock).
    pub fn value(&self) -> T {
        self.value.read().unwrap().clone()
    }

    /// Replace the value. Listeners fire with (old, new) only when the
    /// value actually changed.
    pub fn set(&self, new: T) {
        let old = {
            let mut value = self.value.write().unwrap();
            if *value == new {
                return;
            }
            std::mem::replace(&mut *value, new.clone())
        };
        let listeners: Vec<Listener<T>> =
            self.listeners.read().unwrap().values().cloned().collect();
        for listener in listeners {
            listener(&old, &new);
        }
    }

    /// Register a change listener, returns a key usable with
    /// [`Self::del_listener`].
    pub fn add_listener(&self, f: impl Fn(&T, &T) + Send + Sync + 'static) -> u64 {
        let key = self.listener_key.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().unwrap().insert(key, Arc::new(f));
        key
    }

    pub fn del_listener(&self, key: u64) {
        self.listeners.write().unwrap().remove(&key);
    }
}

/// Object-safe view of a [`ConfigVar`] for the registry and for bulk loads.
trait AnyVar: Send + Sync {
    fn set_json(&self, value: &serde_json::Value) -> Result<()>;
    fn type_name(&self) -> &'static str;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> AnyVar for ConfigVar<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn set_json(&self, value: &serde_json::Value) -> Result<()> {
        let parsed: T = serde_json::from_value(value.clone()).map_err(|e| {
            Error::Config(format!("cannot parse '{}' for {}: {e}", value, self.name))
        })?;
        self.set(parsed);
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn AnyVar>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Namespace for registry operations.
pub struct Config;

impl Config {
    /// Find the variable `name`, creating it with `default` if missing.
    ///
    /// Returns an error when the name is invalid or when a variable with
    /// the same name but a different type is already registered.
    pub fn lookup<T>(name: &str, default: T, description: &str) -> Result<Arc<ConfigVar<T>>>
    where
        T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_')
        {
            return Err(Error::Config(format!("invalid config name '{name}'")));
        }

        {
            let registry = REGISTRY.read().unwrap();
            if let Some(var) = registry.get(name) {
                let type_name = var.type_name();
                return match var.clone().as_any().downcast::<ConfigVar<T>>() {
                    Ok(var) => Ok(var),
                    Err(_) => {
                        log::error!(
                            "config lookup '{name}' exists with type {type_name}, \
                             requested {}",
                            std::any::type_name::<T>(),
                        );
                        Err(Error::Config(format!("type mismatch for '{name}'")))
                    }
                };
            }
        }

        let mut registry = REGISTRY.write().unwrap();
        // Raced with another creator: take theirs.
        if let Some(var) = registry.get(name) {
            return var
                .clone()
                .as_any()
                .downcast::<ConfigVar<T>>()
                .map_err(|_| Error::Config(format!("type mismatch for '{name}'")));
        }
        let var = Arc::new(ConfigVar::new(
            name.to_string(),
            default,
            description.to_string(),
        ));
        registry.insert(name.to_string(), var.clone() as Arc<dyn AnyVar>);
        Ok(var)
    }

    /// Find a registered variable without creating it.
    pub fn get<T>(name: &str) -> Option<Arc<ConfigVar<T>>>
    where
        T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let registry = REGISTRY.read().unwrap();
        registry
            .get(name)?
            .clone()
            .as_any()
            .downcast::<ConfigVar<T>>()
            .ok()
    }

    /// Apply a JSON document to the registry.
    ///
    /// Nested objects flatten into dotted keys (`{"tcp": {"connect":
    /// {"timeout": 250}}}` sets `tcp.connect.timeout`). Keys without a
    /// registered variable are skipped.
    pub fn load_json(text: &str) -> Result<()> {
        let root: serde_json::Value =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        let mut flat = Vec::new();
        flatten("", &root, &mut flat);
        let registry = REGISTRY.read().unwrap();
        for (key, value) in flat {
            match registry.get(&key) {
                Some(var) => var.set_json(value)?,
                None => log::debug!("config load: no variable named '{key}'"),
            }
        }
        Ok(())
    }
}

fn flatten<'v>(prefix: &str, value: &'v serde_json::Value, out: &mut Vec<(String, &'v serde_json::Value)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                flatten(&key, v, out);
            }
        }
        _ => out.push((prefix.to_string(), value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn lookup_returns_same_var() {
        let a = Config::lookup("test.lookup.same", 17u32, "test").unwrap();
        let b = Config::lookup("test.lookup.same", 99u32, "test").unwrap();
        assert_eq!(b.value(), 17);
        a.set(3);
        assert_eq!(b.value(), 3);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        Config::lookup("test.lookup.mismatch", 1u32, "test").unwrap();
        assert!(Config::lookup::<String>("test.lookup.mismatch", "x".into(), "test").is_err());
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(Config::lookup("Bad Name", 0u8, "test").is_err());
        assert!(Config::lookup("", 0u8, "test").is_err());
    }

    #[test]
    fn listeners_fire_on_change_only() {
        let var = Config::lookup("test.listener", 5i64, "test").unwrap();
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        let key = var.add_listener(|old, new| {
            assert_eq!(*old, 5);
            assert_eq!(*new, 6);
            FIRED.fetch_add(1, Ordering::SeqCst);
        });
        var.set(5);
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        var.set(6);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        var.del_listener(key);
        var.set(7);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn json_load_sets_nested_keys() {
        let var = Config::lookup("test.json.depth", 0u64, "test").unwrap();
        Config::load_json(r#"{"test": {"json": {"depth": 42}, "unknown": 1}}"#).unwrap();
        assert_eq!(var.value(), 42);
    }
}
