// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use crate::{TxRandomState, create_set};
use std::{borrow::Borrow, collections::HashSet, fmt, hash::Hash};

/// Pending additions and removals relative to one specific base set.
///
/// The layer never touches its base. [`TransactionalSet`](crate::TransactionalSet) keeps the two
/// halves consistent: a key it registers as created is not simultaneously marked removed.
/// [`SetChanges::clear_all`] is the one operation that marks every base key removed while dropping
/// all pending creations.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(
    feature = "serde",
    serde(bound(
        serialize = "K: Hash + Eq + serde::Serialize",
        deserialize = "K: Hash + Eq + serde::Deserialize<'de>"
    ))
)]
pub struct SetChanges<K> {
    created: HashSet<K, TxRandomState>,
    removed: HashSet<K, TxRandomState>,
}

impl<K> Default for SetChanges<K> {
    fn default() -> Self {
        Self {
            created: create_set(),
            removed: create_set(),
        }
    }
}

impl<K> SetChanges<K>
where
    K: Hash + Eq,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `key` as logically added. Returns `false` if it already was.
    pub fn register_created_key(&mut self, key: K) -> bool {
        self.created.insert(key)
    }

    /// Forgets a pending addition. Returns `false` if there was none.
    pub fn remove_created_key<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.created.remove(key)
    }

    pub fn contains_created<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.created.contains(key)
    }

    /// Records `key` as logically removed from the base. Returns `false` if it already was.
    pub fn register_removed_key(&mut self, key: K) -> bool {
        self.removed.insert(key)
    }

    /// Forgets a pending removal. Returns `false` if there was none.
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

    /// Drops every pending creation and marks every key of `base_keys` as removed.
    pub fn clear_all(&mut self, base_keys: impl IntoIterator<Item = K>) {
        self.created.clear();
        self.removed.extend(base_keys);
    }

    /// Returns an independent copy with the same pending changes.
    pub fn duplicate(&self) -> Self
    where
        K: Clone,
    {
        self.clone()
    }

    pub fn created_key_count(&self) -> usize {
        self.created.len()
    }

    pub fn removed_key_count(&self) -> usize {
        self.removed.len()
    }

    /// Whether the layer records no pending change at all.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty()
    }

    pub fn created_keys(&self) -> impl Iterator<Item = &K> {
        self.created.iter()
    }

    pub fn removed_keys(&self) -> impl Iterator<Item = &K> {
        self.removed.iter()
    }

    pub(crate) fn created(&self) -> &HashSet<K, TxRandomState> {
        &self.created
    }
}

impl<K> PartialEq for SetChanges<K>
where
    K: Hash + Eq,
{
    fn eq(&self, other: &Self) -> bool {
        self.created == other.created && self.removed == other.removed
    }
}

impl<K> Eq for SetChanges<K> where K: Hash + Eq {}

impl<K: fmt::Debug> fmt::Debug for SetChanges<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetChanges")
            .field("created", &self.created)
            .field("removed", &self.removed)
            .finish()
    }
}
