//! Scoped key-value store shared between node bodies.
//!
//! One instance lives for the whole run and is visible to every node; another
//! is created per map iteration and handed only to that iteration's template
//! nodes. The two never merge. Values are cloned out on read, so a body cannot
//! mutate what a later node observes except through [`ScopedStore::set`].

use std::sync::{Arc, Mutex};

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

/// Which lifetime a store belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreScope {
    Run,
    Iteration,
}

impl std::fmt::Display for StoreScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run => f.write_str("run"),
            Self::Iteration => f.write_str("iteration"),
        }
    }
}

/// Raised by [`ScopedStore::require`] when the key was never set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("required key '{key}' is not set in the {scope} store")]
pub struct MissingKeyError {
    pub key: String,
    pub scope: StoreScope,
}

/// Cloneable handle to a scoped key-value map.
#[derive(Debug, Clone)]
pub struct ScopedStore {
    scope: StoreScope,
    entries: Arc<Mutex<IndexMap<String, Value>>>,
}

impl ScopedStore {
    pub fn new(scope: StoreScope) -> Self {
        Self {
            scope,
            entries: Arc::new(Mutex::new(IndexMap::new())),
        }
    }

    /// Run-wide store pre-populated with `seed` (typically the resolved inputs).
    pub fn run_scoped(seed: impl IntoIterator<Item = (String, Value)>) -> Self {
        let store = Self::new(StoreScope::Run);
        store.entries.lock().expect("store lock poisoned").extend(seed);
        store
    }

    pub fn scope(&self) -> StoreScope {
        self.scope
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().expect("store lock poisoned").get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.lock().expect("store lock poisoned").insert(key.into(), value.into());
    }

    pub fn require(&self, key: &str) -> Result<Value, MissingKeyError> {
        self.get(key).ok_or_else(|| MissingKeyError {
            key: key.to_string(),
            scope: self.scope,
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().expect("store lock poisoned").contains_key(key)
    }

    /// Stores any serializable value.
    pub fn set_serialized<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    /// Typed read. Absent keys yield `Ok(None)`; a stored value of the wrong shape is an error.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get(key) {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .with_context(|| format!("{} store key '{}' has an unexpected shape", self.scope, key)),
            None => Ok(None),
        }
    }

    /// Typed [`ScopedStore::require`].
    pub fn require_as<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self.require(key)?;
        serde_json::from_value(value).with_context(|| format!("{} store key '{}' has an unexpected shape", self.scope, key))
    }

    /// Copy of every entry in insertion order.
    pub fn snapshot(&self) -> IndexMap<String, Value> {
        self.entries.lock().expect("store lock poisoned").clone()
    }
}
