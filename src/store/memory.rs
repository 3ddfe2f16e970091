//! In-memory `KeyedStore` backed by a map of individually locked entries.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::store::traits::{KeyedStore, Mutation};

/// Thread-safe map where the outer lock is only held to find an entry.
pub struct MemoryStore<K, V> {
    entity: &'static str,
    entries: RwLock<HashMap<K, Arc<Mutex<V>>>>,
}

impl<K, V> MemoryStore<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// `entity` names the stored kind in NotFound / conflict errors.
    pub fn new(entity: &'static str) -> Self {
        Self {
            entity,
            entries: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        self.entries.read().await.get(key).cloned()
    }

    async fn handles(&self) -> Vec<(K, Arc<Mutex<V>>)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }
}

#[async_trait]
impl<K, V> KeyedStore<K, V> for MemoryStore<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn insert(&self, key: K, value: V) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&key) {
            return Err(Error::conflict(self.entity, &key, "already present", "insert"));
        }
        entries.insert(key, Arc::new(Mutex::new(value)));
        Ok(())
    }

    async fn get(&self, key: &K) -> Option<V> {
        let entry = self.entry(key).await?;
        let value = entry.lock().await.clone();
        Some(value)
    }

    async fn update(&self, key: &K, mutation: Mutation<'_, V>) -> Result<V> {
        let entry = self
            .entry(key)
            .await
            .ok_or_else(|| Error::not_found(self.entity, key))?;
        let mut guard = entry.lock().await;
        let mut draft = guard.clone();
        mutation(&mut draft)?;
        *guard = draft.clone();
        Ok(draft)
    }

    async fn remove(&self, key: &K) -> Option<V> {
        let entry = self.entries.write().await.remove(key)?;
        let value = entry.lock().await.clone();
        Some(value)
    }

    async fn remove_where(&self, remove: &(dyn for<'v> Fn(&'v V) -> bool + Send + Sync)) -> Vec<V> {
        let mut doomed = Vec::new();
        for (key, entry) in self.handles().await {
            let matched = {
                let guard = entry.lock().await;
                remove(&*guard)
            };
            if matched {
                doomed.push(key);
            }
        }

        let detached: Vec<Arc<Mutex<V>>> = {
            let mut entries = self.entries.write().await;
            doomed.iter().filter_map(|key| entries.remove(key)).collect()
        };

        let mut removed = Vec::with_capacity(detached.len());
        for entry in detached {
            removed.push(entry.lock().await.clone());
        }
        removed
    }

    async fn snapshot(&self) -> Vec<V> {
        let mut values = Vec::new();
        for (_, entry) in self.handles().await {
            values.push(entry.lock().await.clone());
        }
        values
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        value: u32,
    }

    #[tokio::test]
    async fn insert_get_and_duplicate() {
        let store: MemoryStore<String, Counter> = MemoryStore::new("counter");
        store.insert("a".into(), Counter { value: 1 }).await.unwrap();
        assert_eq!(store.get(&"a".into()).await, Some(Counter { value: 1 }));

        let err = store.insert("a".into(), Counter { value: 2 }).await.unwrap_err();
        assert!(matches!(err, Error::StateConflict { .. }));
    }

    #[tokio::test]
    async fn failed_mutation_is_not_committed() {
        let store: MemoryStore<String, Counter> = MemoryStore::new("counter");
        store.insert("a".into(), Counter { value: 1 }).await.unwrap();

        let result = store
            .update(
                &"a".into(),
                Box::new(|c: &mut Counter| {
                    c.value = 99;
                    Err(Error::Validation("nope".into()))
                }),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(store.get(&"a".into()).await.unwrap().value, 1);

        let updated = store
            .update(&"a".into(), Box::new(|c: &mut Counter| {
                c.value += 1;
                Ok(())
            }))
            .await
            .unwrap();
        assert_eq!(updated.value, 2);
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store: MemoryStore<String, Counter> = MemoryStore::new("counter");
        let err = store
            .update(&"ghost".into(), Box::new(|_: &mut Counter| Ok(())))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "counter ghost not found");
    }

    #[tokio::test]
    async fn concurrent_updates_on_one_key_are_serialized() {
        let store: Arc<MemoryStore<String, Counter>> = Arc::new(MemoryStore::new("counter"));
        store.insert("a".into(), Counter { value: 0 }).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update(&"a".into(), Box::new(|c: &mut Counter| {
                        c.value += 1;
                        Ok(())
                    }))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get(&"a".into()).await.unwrap().value, 50);
    }

    #[tokio::test]
    async fn remove_where_and_snapshot() {
        let store: MemoryStore<String, Counter> = MemoryStore::new("counter");
        for (k, v) in [("a", 1), ("b", 2), ("c", 3)] {
            store.insert(k.into(), Counter { value: v }).await.unwrap();
        }

        let removed = store.remove_where(&|c: &Counter| c.value >= 2).await;
        assert_eq!(removed.len(), 2);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.snapshot().await, vec![Counter { value: 1 }]);
        assert!(store.remove(&"a".into()).await.is_some());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn remove_where_through_trait_object_with_captured_state() {
        let store: Arc<dyn KeyedStore<String, Counter>> = Arc::new(MemoryStore::new("counter"));
        for (k, v) in [("a", 1), ("b", 5), ("c", 9)] {
            store.insert(k.into(), Counter { value: v }).await.unwrap();
        }

        let floor = 4;
        let mut removed = store.remove_where(&move |c: &Counter| c.value > floor).await;
        removed.sort_by_key(|c| c.value);
        assert_eq!(removed, vec![Counter { value: 5 }, Counter { value: 9 }]);
        assert_eq!(store.len().await, 1);
    }
}
