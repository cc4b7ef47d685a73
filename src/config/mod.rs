//! The typed key-value settings store consumed by the bus surface.
//!
//! The store itself is an external collaborator; only the [`Store`] trait
//! matters to the IPC core. [`MemStore`] is the in-process implementation
//! the daemon and the tests run against: every key has a default, `set`
//! enforces the default's type, and `reset` restores a whole prefix.

mod value;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, bail, Result};

pub use value::Value;

use crate::slots::SlotList;

/// Invoked after a key changed, outside any store lock.
pub type ChangeHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

pub trait Store: Send + Sync {
    /// Current value of `key`; an error if the key does not exist.
    fn get(&self, key: &str) -> Result<Value>;

    /// Set `key`, returning whether the stored value changed. The new value
    /// must match the type of the key's default.
    fn set(&self, key: &str, value: Value) -> Result<bool>;

    /// Restore every key under `prefix` to its default; returns how many
    /// keys were reset.
    fn reset(&self, prefix: &str) -> Result<i32>;

    /// All current key/value pairs.
    fn get_all(&self) -> Vec<(String, Value)>;

    /// Subscribe to changes; the returned id unsubscribes.
    fn subscribe(&self, handler: ChangeHandler) -> u64;

    fn unsubscribe(&self, id: u64);
}

/// In-memory store with per-key defaults.
pub struct MemStore {
    inner: Mutex<MemInner>,
}

struct MemInner {
    values: HashMap<String, Value>,
    defaults: HashMap<String, Value>,
    subscribers: SlotList<ChangeHandler>,
}

impl MemStore {
    pub fn new(defaults: impl IntoIterator<Item = (String, Value)>) -> Self {
        let defaults: HashMap<String, Value> = defaults.into_iter().collect();
        Self {
            inner: Mutex::new(MemInner {
                values: defaults.clone(),
                defaults,
                subscribers: SlotList::new(),
            }),
        }
    }

    fn notify(&self, key: &str, value: &Value) {
        let handlers: Vec<ChangeHandler> = {
            let inner = self.inner.lock().unwrap();
            inner.subscribers.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in handlers {
            handler(key, value);
        }
    }
}

impl Store for MemStore {
    fn get(&self, key: &str) -> Result<Value> {
        self.inner
            .lock()
            .unwrap()
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no such setting: {key}"))
    }

    fn set(&self, key: &str, value: Value) -> Result<bool> {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            let Some(current) = inner.values.get(key) else {
                bail!("no such setting: {key}");
            };
            if !current.same_kind(&value) {
                bail!(
                    "type mismatch for {key}: have {}, got {}",
                    current.type_name(),
                    value.type_name()
                );
            }
            if *current == value {
                false
            } else {
                inner.values.insert(key.to_string(), value.clone());
                true
            }
        };
        if changed {
            self.notify(key, &value);
        }
        Ok(changed)
    }

    fn reset(&self, prefix: &str) -> Result<i32> {
        let changed: Vec<(String, Value)> = {
            let mut inner = self.inner.lock().unwrap();
            let keys: Vec<String> = inner
                .defaults
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            let mut changed = Vec::new();
            for key in keys {
                let default = inner.defaults[&key].clone();
                if inner.values.get(&key) != Some(&default) {
                    inner.values.insert(key.clone(), default.clone());
                    changed.push((key, default));
                }
            }
            changed
        };
        let count = changed.len() as i32;
        for (key, value) in changed {
            self.notify(&key, &value);
        }
        Ok(count)
    }

    fn get_all(&self) -> Vec<(String, Value)> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<_> = inner
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn subscribe(&self, handler: ChangeHandler) -> u64 {
        self.inner.lock().unwrap().subscribers.insert(handler)
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.remove(id);
        inner.subscribers.sweep();
    }
}

/// Settings the daemon ships with.
pub fn default_settings() -> Vec<(String, Value)> {
    vec![
        (
            "/devmode/mode".to_string(),
            Value::String("ask".to_string()),
        ),
        ("/devmode/rescue_enabled".to_string(), Value::Bool(false)),
        (
            "/devmode/targets".to_string(),
            Value::StringList(vec!["charging".to_string(), "developer".to_string()]),
        ),
        ("/devmode/idle_timeout_s".to_string(), Value::Int(600)),
    ]
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn store() -> MemStore {
        MemStore::new(default_settings())
    }

    #[test]
    fn get_unknown_key_fails() {
        assert!(store().get("/nope").is_err());
    }

    #[test]
    fn set_reports_change() {
        let store = store();
        assert!(store
            .set("/devmode/mode", Value::String("developer".into()))
            .unwrap());
        assert!(!store
            .set("/devmode/mode", Value::String("developer".into()))
            .unwrap());
        assert_eq!(
            store.get("/devmode/mode").unwrap(),
            Value::String("developer".into())
        );
    }

    #[test]
    fn set_enforces_type() {
        let store = store();
        assert!(store.set("/devmode/mode", Value::Int(1)).is_err());
        assert!(store.set("/nope", Value::Int(1)).is_err());
    }

    #[test]
    fn reset_restores_defaults_under_prefix() {
        let store = store();
        store
            .set("/devmode/mode", Value::String("developer".into()))
            .unwrap();
        store
            .set("/devmode/rescue_enabled", Value::Bool(true))
            .unwrap();
        assert_eq!(store.reset("/devmode").unwrap(), 2);
        assert_eq!(
            store.get("/devmode/mode").unwrap(),
            Value::String("ask".into())
        );
        assert_eq!(
            store.get("/devmode/rescue_enabled").unwrap(),
            Value::Bool(false)
        );
        // Nothing left to reset.
        assert_eq!(store.reset("/devmode").unwrap(), 0);
    }

    #[test]
    fn subscribers_hear_changes() {
        let store = store();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = store.subscribe({
            let hits = hits.clone();
            Arc::new(move |key, value| {
                assert_eq!(key, "/devmode/idle_timeout_s");
                assert_eq!(*value, Value::Int(60));
                hits.fetch_add(1, Ordering::SeqCst);
            })
        });
        store
            .set("/devmode/idle_timeout_s", Value::Int(60))
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Unchanged set does not notify.
        store
            .set("/devmode/idle_timeout_s", Value::Int(60))
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        store.unsubscribe(id);
        store
            .set("/devmode/idle_timeout_s", Value::Int(30))
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
