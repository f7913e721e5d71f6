// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use crate::{TxRandomState, create_map, create_set};
use std::{
    borrow::Borrow,
    collections::{HashMap, HashSet},
    fmt,
    hash::Hash,
};

/// Pending changes relative to one specific base map.
///
/// Entries fall into three disjoint groups: `created` holds keys absent from the base, `updated`
/// holds new values for base keys, and `removed` holds base keys that are logically gone.
/// [`TransactionalMap`](crate::TransactionalMap) keeps the groups disjoint, which makes the
/// effective length `base + created - removed`.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(
    feature = "serde",
    serde(bound(
        serialize = "K: Hash + Eq + serde::Serialize, V: serde::Serialize",
        deserialize = "K: Hash + Eq + serde::Deserialize<'de>, V: serde::Deserialize<'de>"
    ))
)]
pub struct MapChanges<K, V> {
    created: HashMap<K, V, TxRandomState>,
    updated: HashMap<K, V, TxRandomState>,
    removed: HashSet<K, TxRandomState>,
}

impl<K, V> Default for MapChanges<K, V> {
    fn default() -> Self {
        Self {
            created: create_map(),
            updated: create_map(),
            removed: create_set(),
        }
    }
}

impl<K, V> MapChanges<K, V>
where
    K: Hash + Eq,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_created(&mut self, key: K, value: V) -> Option<V> {
        self.created.insert(key, value)
    }

    pub fn remove_created<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.created.remove(key)
    }

    pub fn get_created<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.created.get(key)
    }

    pub fn insert_updated(&mut self, key: K, value: V) -> Option<V> {
        self.updated.insert(key, value)
    }

    pub fn remove_updated<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.updated.remove(key)
    }

    pub fn get_updated<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.updated.get(key)
    }

    pub fn register_removed_key(&mut self, key: K) -> bool {
        self.removed.insert(key)
    }

    pub fn remove_removed_key<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.removed.remove(key)
    }

    pub fn contains_removed<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.removed.contains(key)
    }

    /// Drops every pending creation and update and marks every key of `base_keys` as removed.
    pub fn clear_all(&mut self, base_keys: impl IntoIterator<Item = K>) {
        self.created.clear();
        self.updated.clear();
        self.removed.extend(base_keys);
    }

    /// Returns an independent copy with the same pending changes.
    pub fn duplicate(&self) -> Self
    where
        K: Clone,
        V: Clone,
    {
        self.clone()
    }

    pub fn created_key_count(&self) -> usize {
        self.created.len()
    }

    pub fn updated_key_count(&self) -> usize {
        self.updated.len()
    }

    pub fn removed_key_count(&self) -> usize {
        self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn created_entries(&self) -> impl Iterator<Item = (&K, &V)> {
        self.created.iter()
    }

    pub fn updated_entries(&self) -> impl Iterator<Item = (&K, &V)> {
        self.updated.iter()
    }

    pub fn removed_keys(&self) -> impl Iterator<Item = &K> {
        self.removed.iter()
    }

    pub(crate) fn created(&self) -> &HashMap<K, V, TxRandomState> {
        &self.created
    }
}

impl<K, V> PartialEq for MapChanges<K, V>
where
    K: Hash + Eq,
    V: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.created == other.created
            && self.updated == other.updated
            && self.removed == other.removed
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for MapChanges<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapChanges")
            .field("created", &self.created)
            .field("updated", &self.updated)
            .field("removed", &self.removed)
            .finish()
    }
}
