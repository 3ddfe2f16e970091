//! `KeyedStore`: the single async interface every registry goes through.
//!
//! Updates are per-key and atomic: a mutation runs against a private copy of
//! the entry and is committed only when it returns `Ok`. Snapshots never hold
//! a registry-wide lock while reading entries.

use async_trait::async_trait;

use crate::error::Result;

/// A fallible in-place change applied to one entry.
pub type Mutation<'a, V> = Box<dyn FnOnce(&mut V) -> Result<()> + Send + 'a>;

/// Backend-agnostic keyed registry.
#[async_trait]
pub trait KeyedStore<K, V>: Send + Sync
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Insert a new entry. Fails with a state conflict if the key exists.
    async fn insert(&self, key: K, value: V) -> Result<()>;

    /// Get a copy of an entry.
    async fn get(&self, key: &K) -> Option<V>;

    /// Apply a mutation atomically and return the committed value.
    async fn update(&self, key: &K, mutation: Mutation<'_, V>) -> Result<V>;

    /// Remove an entry.
    async fn remove(&self, key: &K) -> Option<V>;

    /// Remove every entry for which `remove` returns true. Returns the removed values.
    async fn remove_where(&self, remove: &(dyn for<'v> Fn(&'v V) -> bool + Send + Sync)) -> Vec<V>;

    /// Point-in-time copy of all entries.
    async fn snapshot(&self) -> Vec<V>;

    /// Number of entries.
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
