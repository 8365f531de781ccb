//! Response cache placed in front of the dispatcher.
//!
//! Calls are keyed by the SHA-256 of their canonical JSON form (object keys
//! sorted at every level), so two calls that differ only in key order share
//! an entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::call::{CallResult, PendingCall};

/// Canonical hash of a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash a call in canonical form.
    pub fn for_call(call: &PendingCall) -> Self {
        // PendingCall only holds strings, numbers and JSON values.
        let value = serde_json::to_value(call).unwrap_or(Value::Null);
        Self::for_value(&value)
    }

    /// Hash any JSON value in canonical form.
    pub fn for_value(value: &Value) -> Self {
        let canonical = canonicalize(value).to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rebuild a value with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Lookup/store collaborator consulted before a call is queued.
pub trait ResponseCache: Send + Sync {
    fn lookup(&self, key: &CacheKey) -> Option<CallResult>;
    fn store(&self, key: CacheKey, result: &CallResult);
}

/// In-process cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<CacheKey, CallResult>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    // Entries are inserted whole, so a poisoned map is still usable.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<CacheKey, CallResult>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<CacheKey, CallResult>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResponseCache for MemoryCache {
    fn lookup(&self, key: &CacheKey) -> Option<CallResult> {
        self.read().get(key).cloned()
    }

    fn store(&self, key: CacheKey, result: &CallResult) {
        self.write().insert(key, result.clone());
    }
}
