//! Storage-engine stand-in (§10.5): the shape of "a local command processor",
//! not the production engine. `StorageEngine` is the trait a [`crate::node::LocalNode`]
//! dispatches [`terrastore_core::Command`]s against; [`InMemoryStorageEngine`] is the
//! one implementation provided for tests and examples.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use terrastore_core::command::KeyRange;
use terrastore_core::ErrorMessage;

/// A named server-side function invoked by `Command::Update` (§4.5). The
/// actual scripting engine (server-side JavaScript, per §1) is out of scope;
/// this is a registry of native closures standing in for it.
pub type UpdateFn = Arc<dyn Fn(Option<&[u8]>, &[u8]) -> Result<Vec<u8>, ErrorMessage> + Send + Sync>;

/// A local command processor: in-memory storage keyed by `(bucket, key)`,
/// with per-bucket ordering for `KeysInRange`.
///
/// Operations that touch a single `(bucket, key)` pair acquire that bucket's
/// lock for the duration of the call (§5, "fine-grained key lock"); there is
/// no cross-bucket ordering.
pub trait StorageEngine: Send + Sync + 'static {
    /// Bucket names with at least one key, as observed at call time.
    fn get_buckets(&self) -> Vec<String>;

    /// Keys in `bucket`, unordered.
    ///
    /// # Errors
    /// Never returns an error; an unknown bucket yields an empty set.
    fn get_keys(&self, bucket: &str) -> Result<Vec<String>, ErrorMessage>;

    /// Keys in `bucket` within `range`, ordered lexicographically, capped at `limit`.
    fn keys_in_range(&self, bucket: &str, range: &KeyRange, limit: Option<u32>) -> Result<Vec<String>, ErrorMessage>;

    /// The value at `(bucket, key)`, or `None` if absent. `predicate` is an
    /// opaque name the caller pre-validated; this stand-in ignores it.
    fn get_value(&self, bucket: &str, key: &str, predicate: Option<&str>) -> Result<Option<Vec<u8>>, ErrorMessage>;

    /// Values for `keys` in `bucket`; missing keys are simply absent from the map.
    fn get_values(&self, bucket: &str, keys: &[String], predicate: Option<&str>) -> Result<BTreeMap<String, Vec<u8>>, ErrorMessage>;

    /// Writes `value` at `(bucket, key)`.
    fn put_value(&self, bucket: &str, key: &str, value: Vec<u8>, predicate: Option<&str>) -> Result<(), ErrorMessage>;

    /// Removes the value at `(bucket, key)`. Not an error if absent.
    fn remove_value(&self, bucket: &str, key: &str) -> Result<(), ErrorMessage>;

    /// Removes `keys` from `bucket`, returning the removed `key -> value` pairs.
    fn remove_values(&self, bucket: &str, keys: &[String], predicate: Option<&str>) -> Result<BTreeMap<String, Vec<u8>>, ErrorMessage>;

    /// Drops an entire bucket. (§9: multicast over clusters is not atomic;
    /// this method only guarantees the local bucket.)
    fn remove_bucket(&self, bucket: &str) -> Result<(), ErrorMessage>;

    /// Applies the named function to the current value at `(bucket, key)`
    /// (or `None` if absent) with `params`, stores and returns the result.
    ///
    /// # Errors
    /// [`ErrorMessage`] if `function` is not registered, or if the function itself fails.
    fn update(&self, bucket: &str, key: &str, function: &str, params: &[u8]) -> Result<Vec<u8>, ErrorMessage>;

    /// Registers a named function usable by [`StorageEngine::update`].
    fn register_function(&self, name: &str, f: UpdateFn);
}

/// In-memory [`StorageEngine`]: one [`RwLock<BTreeMap>`] per bucket, so
/// `KeysInRange` can iterate in sorted order without a secondary index.
#[derive(Default)]
pub struct InMemoryStorageEngine {
    buckets: RwLock<HashMap<String, RwLock<BTreeMap<String, Vec<u8>>>>>,
    functions: RwLock<HashMap<String, UpdateFn>>,
}

impl InMemoryStorageEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_bucket<T>(&self, bucket: &str, create: bool, f: impl FnOnce(&RwLock<BTreeMap<String, Vec<u8>>>) -> T) -> Option<T> {
        {
            let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
            if let Some(b) = buckets.get(bucket) {
                return Some(f(b));
            }
        }
        if !create {
            return None;
        }
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let entry = buckets.entry(bucket.to_string()).or_default();
        Some(f(entry))
    }
}

impl StorageEngine for InMemoryStorageEngine {
    fn get_buckets(&self) -> Vec<String> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets
            .iter()
            .filter(|(_, b)| !b.read().unwrap_or_else(|e| e.into_inner()).is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn get_keys(&self, bucket: &str) -> Result<Vec<String>, ErrorMessage> {
        Ok(self
            .with_bucket(bucket, false, |b| b.read().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect())
            .unwrap_or_default())
    }

    fn keys_in_range(&self, bucket: &str, range: &KeyRange, limit: Option<u32>) -> Result<Vec<String>, ErrorMessage> {
        let keys = self
            .with_bucket(bucket, false, |b| {
                let map = b.read().unwrap_or_else(|e| e.into_inner());
                let iter = map.keys();
                let filtered: Vec<String> = iter
                    .filter(|k| range.start.as_ref().is_none_or(|s| k.as_str() >= s.as_str()))
                    .filter(|k| range.end.as_ref().is_none_or(|e| k.as_str() <= e.as_str()))
                    .cloned()
                    .collect();
                filtered
            })
            .unwrap_or_default();
        match limit {
            Some(n) => Ok(keys.into_iter().take(n as usize).collect()),
            None => Ok(keys),
        }
    }

    fn get_value(&self, bucket: &str, key: &str, _predicate: Option<&str>) -> Result<Option<Vec<u8>>, ErrorMessage> {
        Ok(self
            .with_bucket(bucket, false, |b| b.read().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
            .flatten())
    }

    fn get_values(&self, bucket: &str, keys: &[String], _predicate: Option<&str>) -> Result<BTreeMap<String, Vec<u8>>, ErrorMessage> {
        Ok(self
            .with_bucket(bucket, false, |b| {
                let map = b.read().unwrap_or_else(|e| e.into_inner());
                keys.iter().filter_map(|k| map.get(k).map(|v| (k.clone(), v.clone()))).collect()
            })
            .unwrap_or_default())
    }

    fn put_value(&self, bucket: &str, key: &str, value: Vec<u8>, _predicate: Option<&str>) -> Result<(), ErrorMessage> {
        self.with_bucket(bucket, true, |b| {
            b.write().unwrap_or_else(|e| e.into_inner()).insert(key.to_string(), value);
        });
        Ok(())
    }

    fn remove_value(&self, bucket: &str, key: &str) -> Result<(), ErrorMessage> {
        self.with_bucket(bucket, false, |b| {
            b.write().unwrap_or_else(|e| e.into_inner()).remove(key);
        });
        Ok(())
    }

    fn remove_values(&self, bucket: &str, keys: &[String], _predicate: Option<&str>) -> Result<BTreeMap<String, Vec<u8>>, ErrorMessage> {
        Ok(self
            .with_bucket(bucket, false, |b| {
                let mut map = b.write().unwrap_or_else(|e| e.into_inner());
                keys.iter().filter_map(|k| map.remove(k).map(|v| (k.clone(), v))).collect()
            })
            .unwrap_or_default())
    }

    fn remove_bucket(&self, bucket: &str) -> Result<(), ErrorMessage> {
        self.buckets.write().unwrap_or_else(|e| e.into_inner()).remove(bucket);
        Ok(())
    }

    fn update(&self, bucket: &str, key: &str, function: &str, params: &[u8]) -> Result<Vec<u8>, ErrorMessage> {
        let f = {
            let functions = self.functions.read().unwrap_or_else(|e| e.into_inner());
            functions
                .get(function)
                .cloned()
                .ok_or_else(|| ErrorMessage::new(404, format!("unknown update function '{function}'")))?
        };
        self.with_bucket(bucket, true, |b| -> Result<Vec<u8>, ErrorMessage> {
            let mut map = b.write().unwrap_or_else(|e| e.into_inner());
            let current = map.get(key).map(Vec::as_slice);
            let updated = f(current, params)?;
            map.insert(key.to_string(), updated.clone());
            Ok(updated)
        })
        .unwrap_or_else(|| Err(ErrorMessage::new(500, "bucket lock poisoned".to_string())))
    }

    fn register_function(&self, name: &str, f: UpdateFn) {
        self.functions.write().unwrap_or_else(|e| e.into_inner()).insert(name.to_string(), f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let engine = InMemoryStorageEngine::new();
        engine.put_value("b", "k", vec![1, 2, 3], None).unwrap();
        assert_eq!(engine.get_value("b", "k", None).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn get_on_missing_bucket_is_empty_not_error() {
        let engine = InMemoryStorageEngine::new();
        assert_eq!(engine.get_value("missing", "k", None).unwrap(), None);
        assert_eq!(engine.get_keys("missing").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn remove_value_then_get_is_none() {
        let engine = InMemoryStorageEngine::new();
        engine.put_value("b", "k", vec![1], None).unwrap();
        engine.remove_value("b", "k").unwrap();
        assert_eq!(engine.get_value("b", "k", None).unwrap(), None);
    }

    #[test]
    fn remove_values_returns_removed_pairs() {
        let engine = InMemoryStorageEngine::new();
        engine.put_value("b", "k1", vec![1], None).unwrap();
        engine.put_value("b", "k2", vec![2], None).unwrap();
        let removed = engine.remove_values("b", &["k1".into(), "k3".into()], None).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed.get("k1"), Some(&vec![1]));
        assert_eq!(engine.get_value("b", "k2", None).unwrap(), Some(vec![2]));
    }

    #[test]
    fn keys_in_range_is_sorted_and_bounded() {
        let engine = InMemoryStorageEngine::new();
        for k in ["a", "b", "c", "d", "e"] {
            engine.put_value("bucket", k, vec![], None).unwrap();
        }
        let range = KeyRange { start: Some("b".into()), end: Some("d".into()) };
        assert_eq!(engine.keys_in_range("bucket", &range, None).unwrap(), vec!["b", "c", "d"]);
        assert_eq!(engine.keys_in_range("bucket", &range, Some(2)).unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn get_buckets_excludes_empty_buckets() {
        let engine = InMemoryStorageEngine::new();
        engine.put_value("b1", "k", vec![], None).unwrap();
        engine.put_value("b2", "k", vec![], None).unwrap();
        engine.remove_value("b2", "k").unwrap();
        assert_eq!(engine.get_buckets(), vec!["b1".to_string()]);
    }

    #[test]
    fn remove_bucket_drops_all_keys() {
        let engine = InMemoryStorageEngine::new();
        engine.put_value("b", "k1", vec![], None).unwrap();
        engine.put_value("b", "k2", vec![], None).unwrap();
        engine.remove_bucket("b").unwrap();
        assert_eq!(engine.get_keys("b").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn update_applies_registered_function() {
        let engine = InMemoryStorageEngine::new();
        engine.register_function("increment", Arc::new(|current: Option<&[u8]>, _params: &[u8]| {
            let n = current.and_then(|c| c.first().copied()).unwrap_or(0);
            Ok(vec![n + 1])
        }));
        engine.put_value("b", "counter", vec![5], None).unwrap();
        let result = engine.update("b", "counter", "increment", &[]).unwrap();
        assert_eq!(result, vec![6]);
        assert_eq!(engine.get_value("b", "counter", None).unwrap(), Some(vec![6]));
    }

    #[test]
    fn update_with_unknown_function_is_processing_error() {
        let engine = InMemoryStorageEngine::new();
        let err = engine.update("b", "k", "nope", &[]).unwrap_err();
        assert_eq!(err.code, 404);
    }

    #[test]
    fn update_function_error_propagates() {
        let engine = InMemoryStorageEngine::new();
        engine.register_function("fail", Arc::new(|_current, _params| {
            Err(ErrorMessage::new(409, "condition not satisfied".to_string()))
        }));
        engine.put_value("b", "k", vec![1], None).unwrap();
        let err = engine.update("b", "k", "fail", &[]).unwrap_err();
        assert_eq!(err.code, 409);
        assert_eq!(engine.get_value("b", "k", None).unwrap(), Some(vec![1]));
    }
}
