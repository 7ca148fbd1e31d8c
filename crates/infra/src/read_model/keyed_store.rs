use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

use debts_core::AggregateId;

/// Key/value store for read models, partitioned by the ledger (aggregate
/// stream) the records were derived from.
pub trait KeyedStore<K, V>: Send + Sync {
    fn get(&self, ledger_id: AggregateId, key: &K) -> Option<V>;
    fn upsert(&self, ledger_id: AggregateId, key: K, value: V);
    fn list(&self, ledger_id: AggregateId) -> Vec<V>;
    /// Clear every record of one ledger (rebuild support).
    fn clear_ledger(&self, ledger_id: AggregateId);
}

impl<K, V, S> KeyedStore<K, V> for Arc<S>
where
    S: KeyedStore<K, V> + ?Sized,
{
    fn get(&self, ledger_id: AggregateId, key: &K) -> Option<V> {
        (**self).get(ledger_id, key)
    }

    fn upsert(&self, ledger_id: AggregateId, key: K, value: V) {
        (**self).upsert(ledger_id, key, value)
    }

    fn list(&self, ledger_id: AggregateId) -> Vec<V> {
        (**self).list(ledger_id)
    }

    fn clear_ledger(&self, ledger_id: AggregateId) {
        (**self).clear_ledger(ledger_id)
    }
}

/// In-memory keyed store.
///
/// Each write is a single map operation, so a panic elsewhere cannot leave
/// the map half-updated; a poisoned lock is recovered, not treated as empty.
#[derive(Debug)]
pub struct InMemoryKeyedStore<K, V> {
    inner: RwLock<HashMap<(AggregateId, K), V>>,
}

impl<K, V> InMemoryKeyedStore<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryKeyedStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KeyedStore<K, V> for InMemoryKeyedStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, ledger_id: AggregateId, key: &K) -> Option<V> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&(ledger_id, key.clone())).cloned()
    }

    fn upsert(&self, ledger_id: AggregateId, key: K, value: V) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.insert((ledger_id, key), value);
    }

    fn list(&self, ledger_id: AggregateId) -> Vec<V> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.iter()
            .filter_map(|((l, _k), v)| if *l == ledger_id { Some(v.clone()) } else { None })
            .collect()
    }

    fn clear_ledger(&self, ledger_id: AggregateId) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.retain(|(l, _k), _v| *l != ledger_id);
    }
}
