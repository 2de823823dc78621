//! Keyed table capability and its in-memory backend.
//!
//! Service, destination and connection tables are all fixed key/result
//! stores. The control plane writes them while the forwarding path reads
//! (and, for connections, writes) them concurrently, so every method takes
//! `&self` and the backend is responsible for single-record atomicity.
//!
//! Like [`std::collections::HashMap`] wrappers elsewhere in the workspace,
//! the API never creates entries implicitly: `modify`, `delete` and
//! `lookup` all report [`DbError::NotFound`] for a missing key.

use crate::status::{DbError, DbResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;

/// Fixed key/result storage.
pub trait KeyedStore<K, V>: Send + Sync {
    /// Adds an entry, replacing the result if the key already exists.
    fn insert(&self, key: K, value: V) -> DbResult<()>;

    /// Replaces the result of an existing entry.
    fn modify(&self, key: &K, value: V) -> DbResult<()>;

    /// Removes an existing entry.
    fn delete(&self, key: &K) -> DbResult<()>;

    /// Returns a copy of the result stored for `key`.
    fn lookup(&self, key: &K) -> DbResult<V>;

    /// Removes every entry.
    fn clear_all(&self) -> DbResult<()>;

    /// Number of entries currently stored.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded in-memory table.
///
/// Inserting a new key into a full table fails with a backend error, which
/// is how a hardware table reports exhausted capacity.
#[derive(Debug)]
pub struct MemStore<K, V>
where
    K: Eq + Hash,
{
    name: String,
    inner: DashMap<K, V>,
    max_entries: usize,
}

impl<K, V> MemStore<K, V>
where
    K: Eq + Hash,
{
    /// Creates an empty table holding at most `max_entries` entries.
    pub fn new(name: impl Into<String>, max_entries: usize) -> Self {
        Self {
            name: name.into(),
            inner: DashMap::new(),
            max_entries,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Applies `f` to the result stored for `key` in place.
    ///
    /// The entry stays locked for the duration of `f`.
    pub fn update<F>(&self, key: &K, f: F) -> DbResult<()>
    where
        F: FnOnce(&mut V),
    {
        match self.inner.get_mut(key) {
            Some(mut entry) => {
                f(entry.value_mut());
                Ok(())
            }
            None => Err(DbError::NotFound),
        }
    }
}

impl<K, V> KeyedStore<K, V> for MemStore<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn insert(&self, key: K, value: V) -> DbResult<()> {
        let at_capacity = self.inner.len() >= self.max_entries;
        match self.inner.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.insert(value);
                Ok(())
            }
            Entry::Vacant(_) if at_capacity => Err(DbError::backend(format!(
                "{} table full ({} entries)",
                self.name, self.max_entries
            ))),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    fn modify(&self, key: &K, value: V) -> DbResult<()> {
        self.update(key, |existing| *existing = value)
    }

    fn delete(&self, key: &K) -> DbResult<()> {
        self.inner.remove(key).map(|_| ()).ok_or(DbError::NotFound)
    }

    fn lookup(&self, key: &K) -> DbResult<V> {
        self.inner
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or(DbError::NotFound)
    }

    fn clear_all(&self) -> DbResult<()> {
        self.inner.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
