//! The in-memory key-value store: a keyed mapping plus a parallel expiry mapping.
//!
//! Grounded on the concurrency contract in the data model (§3/§4.4 of the
//! design spec): all mutation is serialized with respect to snapshot
//! production via a single `parking_lot::RwLock`, mirroring the reader-writer
//! lock strategy the teacher crate uses around its sharded databases, just
//! without the sharding (multi-database namespaces beyond database 0 are a
//! Non-goal here).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::core::errors::RedwireError;

/// A stored value: either a plain string or a hash of string fields to string values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(Bytes),
    Hash(HashMap<String, Bytes>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
        }
    }
}

/// Expiry option parsed from a `SET` command's trailing arguments.
#[derive(Debug, Clone, Copy)]
pub enum Expiry {
    Px(u64),
    Ex(u64),
}

struct Inner {
    values: HashMap<String, Value>,
    expiry: HashMap<String, Instant>,
}

/// The store itself. Cheap to clone (it's just an `Arc` internally via callers
/// holding `Arc<Store>`); the lock lives here so every command handler shares
/// one serialization point.
pub struct Store {
    inner: RwLock<Inner>,
}

impl Store {
    pub fn new() -> Self {
        Store {
            inner: RwLock::new(Inner {
                values: HashMap::new(),
                expiry: HashMap::new(),
            }),
        }
    }

    /// Removes `key` from both maps if its expiry has passed. Returns true if
    /// the key was removed. Must be called with the write lock already held.
    fn expire_if_due(inner: &mut Inner, key: &str) -> bool {
        if let Some(&deadline) = inner.expiry.get(key) {
            if Instant::now() >= deadline {
                inner.values.remove(key);
                inner.expiry.remove(key);
                return true;
            }
        }
        false
    }

    /// `SET key value [PX ms | EX s]`. At most one expiry option is allowed.
    pub fn set(&self, key: String, value: Bytes, expiry: Option<Expiry>) {
        let mut inner = self.inner.write();
        inner.values.insert(key.clone(), Value::Str(value));
        match expiry {
            Some(Expiry::Px(ms)) => {
                inner.expiry.insert(key, Instant::now() + Duration::from_millis(ms));
            }
            Some(Expiry::Ex(s)) => {
                inner.expiry.insert(key, Instant::now() + Duration::from_secs(s));
            }
            None => {
                inner.expiry.remove(&key);
            }
        }
    }

    /// `GET key`. Lazily expires the key if its deadline has passed.
    pub fn get(&self, key: &str) -> Result<Option<Bytes>, RedwireError> {
        let mut inner = self.inner.write();
        if Self::expire_if_due(&mut inner, key) {
            return Ok(None);
        }
        match inner.values.get(key) {
            None => Ok(None),
            Some(Value::Str(b)) => Ok(Some(b.clone())),
            Some(Value::Hash(_)) => Err(RedwireError::WrongType),
        }
    }

    /// `HSET key field value [field value ...]`.
    pub fn hset(&self, key: String, pairs: Vec<(String, Bytes)>) -> Result<(), RedwireError> {
        let mut inner = self.inner.write();
        Self::expire_if_due(&mut inner, &key);
        match inner.values.entry(key).or_insert_with(|| Value::Hash(HashMap::new())) {
            Value::Hash(map) => {
                for (field, value) in pairs {
                    map.insert(field, value);
                }
                Ok(())
            }
            Value::Str(_) => Err(RedwireError::WrongType),
        }
    }

    /// `HGET key field`.
    pub fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, RedwireError> {
        let mut inner = self.inner.write();
        if Self::expire_if_due(&mut inner, key) {
            return Ok(None);
        }
        match inner.values.get(key) {
            None => Ok(None),
            Some(Value::Hash(map)) => Ok(map.get(field).cloned()),
            Some(Value::Str(_)) => Err(RedwireError::WrongType),
        }
    }

    /// `HGETALL key`, returned as alternating (field, value) pairs.
    pub fn hgetall(&self, key: &str) -> Result<Vec<(String, Bytes)>, RedwireError> {
        let mut inner = self.inner.write();
        if Self::expire_if_due(&mut inner, key) {
            return Ok(Vec::new());
        }
        match inner.values.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Hash(map)) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            Some(Value::Str(_)) => Err(RedwireError::WrongType),
        }
    }

    /// `DEL key [key ...]`. Returns the number of keys actually removed.
    pub fn del(&self, keys: &[String]) -> usize {
        let mut inner = self.inner.write();
        let mut removed = 0;
        for key in keys {
            Self::expire_if_due(&mut inner, key);
            if inner.values.remove(key).is_some() {
                inner.expiry.remove(key);
                removed += 1;
            }
        }
        removed
    }

    /// `EXISTS key [key ...]`. Returns the number of keys currently present.
    pub fn exists(&self, keys: &[String]) -> usize {
        let mut inner = self.inner.write();
        let mut count = 0;
        for key in keys {
            Self::expire_if_due(&mut inner, key);
            if inner.values.contains_key(key) {
                count += 1;
            }
        }
        count
    }

    /// Number of live keys (used for `INFO`/logging, not a spec-required op).
    pub fn len(&self) -> usize {
        self.inner.read().values.len()
    }

    /// Takes a consistent point-in-time copy of both maps for RDB marshalling.
    /// Briefly holds the write lock so no mutation can interleave with the copy,
    /// matching the "copy-on-snapshot" strategy the concurrency contract allows.
    pub fn snapshot(&self) -> (HashMap<String, Value>, HashMap<String, Instant>) {
        let inner = self.inner.write();
        (inner.values.clone(), inner.expiry.clone())
    }

    /// Replaces the entire store contents, used when loading an RDB file at
    /// startup. Entries already expired by wall-clock time are dropped by the
    /// caller before this is invoked (the RDB reader does this itself).
    pub fn load(&self, values: HashMap<String, Value>, expiry: HashMap<String, Instant>) {
        let mut inner = self.inner.write();
        inner.values = values;
        inner.expiry = expiry;
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_roundtrips() {
        let store = Store::new();
        store.set("foo".into(), Bytes::from_static(b"bar"), None);
        assert_eq!(store.get("foo").unwrap(), Some(Bytes::from_static(b"bar")));
    }

    #[test]
    fn get_missing_key_is_none() {
        let store = Store::new();
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn px_expiry_makes_key_disappear() {
        let store = Store::new();
        store.set("foo".into(), Bytes::from_static(b"bar"), Some(Expiry::Px(10)));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(store.get("foo").unwrap(), None);
    }

    #[test]
    fn hset_hget_hgetall() {
        let store = Store::new();
        store
            .hset(
                "h".into(),
                vec![("a".into(), Bytes::from_static(b"1")), ("b".into(), Bytes::from_static(b"2"))],
            )
            .unwrap();
        assert_eq!(store.hget("h", "a").unwrap(), Some(Bytes::from_static(b"1")));
        let mut all = store.hgetall("h").unwrap();
        all.sort();
        assert_eq!(
            all,
            vec![("a".to_string(), Bytes::from_static(b"1")), ("b".to_string(), Bytes::from_static(b"2"))]
        );
    }

    #[test]
    fn get_on_hash_is_wrong_type() {
        let store = Store::new();
        store.hset("h".into(), vec![("a".into(), Bytes::from_static(b"1"))]).unwrap();
        assert!(matches!(store.get("h"), Err(RedwireError::WrongType)));
    }

    #[test]
    fn del_and_exists() {
        let store = Store::new();
        store.set("a".into(), Bytes::from_static(b"1"), None);
        store.set("b".into(), Bytes::from_static(b"2"), None);
        assert_eq!(store.exists(&["a".to_string(), "c".to_string()]), 1);
        assert_eq!(store.del(&["a".to_string(), "c".to_string()]), 1);
        assert_eq!(store.exists(&["a".to_string()]), 0);
    }
}
