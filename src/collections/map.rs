// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use super::map_changes::MapChanges;
use crate::{
    DETERMINISTIC_HASHER, LayerId, TransactionContext, TransactionalElement,
    TransactionalLayerCreator, TransactionalLayerMaintainer, TransactionalLayerProducer,
    TxRandomState, create_map,
};
use std::{
    borrow::Borrow,
    collections::{HashMap, hash_map},
    fmt,
    hash::{BuildHasher, Hash, Hasher},
    iter::FusedIterator,
    sync::Arc,
};

/// A map whose reads and writes go through the delta layer of the active transaction.
///
/// Follows the same pattern as [`TransactionalSet`](crate::TransactionalSet): an `Arc`-shared
/// immutable base, a [`MapChanges`] layer for pending changes, and copy-on-write mutation of the
/// base when no transaction is open.
///
/// Values may themselves be transactional structures. On commit, each value is replaced by its
/// committed copy, so nested structures mutated in the same transaction are folded bottom-up.
///
/// ```
/// use txmem::{TransactionContext, TransactionalMap};
///
/// let mut tx = TransactionContext::new();
/// let mut stock = TransactionalMap::from_iter([("apples", 3), ("pears", 5)]);
///
/// tx.open();
/// assert_eq!(stock.insert(&mut tx, "apples", 4), Some(3));
/// assert_eq!(stock.remove(&mut tx, &"pears"), Some(5));
/// assert_eq!(stock.get(&tx, &"apples"), Some(&4));
/// assert_eq!(stock.len(&tx), 1);
///
/// tx.rollback();
/// assert_eq!(stock.get(&tx, &"apples"), Some(&3));
/// ```
#[derive(Clone)]
pub struct TransactionalMap<K, V> {
    id: LayerId,
    base: Arc<HashMap<K, V, TxRandomState>>,
}

impl<K, V> TransactionalMap<K, V> {
    pub fn new() -> Self {
        Self::with_base(Arc::new(create_map()))
    }

    pub fn with_base(base: Arc<HashMap<K, V, TxRandomState>>) -> Self {
        Self {
            id: LayerId::next(),
            base,
        }
    }

    /// The committed base value, ignoring any pending changes.
    pub fn base(&self) -> &Arc<HashMap<K, V, TxRandomState>> {
        &self.base
    }
}

impl<K, V> Default for TransactionalMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> FromIterator<(K, V)> for TransactionalMap<K, V>
where
    K: Hash + Eq,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut base = create_map();
        base.extend(iter);
        Self::with_base(Arc::new(base))
    }
}

impl<K, V> TransactionalMap<K, V>
where
    K: Hash + Eq + TransactionalElement + 'static,
    V: TransactionalElement + 'static,
{
    pub fn view<'a>(&'a self, tx: &'a TransactionContext) -> MapView<'a, K, V> {
        MapView {
            base: &self.base,
            layer: tx.get_transactional_memory_layer_if_exists(self),
        }
    }

    pub fn len(&self, tx: &TransactionContext) -> usize {
        self.view(tx).len()
    }

    pub fn is_empty(&self, tx: &TransactionContext) -> bool {
        self.view(tx).is_empty()
    }

    pub fn get<'a, Q>(&'a self, tx: &'a TransactionContext, key: &Q) -> Option<&'a V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.view(tx).get(key)
    }

    pub fn contains_key<Q>(&self, tx: &TransactionContext, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.view(tx).get(key).is_some()
    }

    pub fn iter<'a>(&'a self, tx: &'a TransactionContext) -> Iter<'a, K, V> {
        self.view(tx).iter()
    }

    /// Sets `key` to `value`, returning the previously visible value.
    pub fn insert(&mut self, tx: &mut TransactionContext, key: K, value: V) -> Option<V> {
        let Some(layer) = tx.get_transactional_memory_layer(self) else {
            return Arc::make_mut(&mut self.base).insert(key, value);
        };
        if layer.get_created(&key).is_some() {
            return layer.insert_created(key, value);
        }
        match self.base.get(&key) {
            Some(_) if layer.remove_removed_key(&key) => {
                layer.insert_updated(key, value);
                None
            }
            Some(current) => {
                let current = current.clone();
                Some(layer.insert_updated(key, value).unwrap_or(current))
            }
            None => layer.insert_created(key, value),
        }
    }

    /// Removes `key`, returning the previously visible value.
    pub fn remove<Q>(&mut self, tx: &mut TransactionContext, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(layer) = tx.get_transactional_memory_layer(self) else {
            return Arc::make_mut(&mut self.base).remove(key);
        };
        if let Some(previous) = layer.remove_created(key) {
            return Some(previous);
        }
        if layer.contains_removed(key) {
            return None;
        }
        let (existing, current) = self.base.get_key_value(key)?;
        layer.register_removed_key(existing.clone());
        Some(layer.remove_updated(key).unwrap_or_else(|| current.clone()))
    }

    pub fn clear(&mut self, tx: &mut TransactionContext) {
        match tx.get_transactional_memory_layer(self) {
            Some(layer) => layer.clear_all(self.base.keys().cloned()),
            None => self.base = Arc::new(create_map()),
        }
    }

    /// Returns an independent copy under a fresh identity, duplicating any visible layer.
    pub fn duplicate(&self, tx: &mut TransactionContext) -> Self {
        let copy = Self::with_base(Arc::clone(&self.base));
        if let Some(layer) = tx
            .get_transactional_memory_layer_if_exists(self)
            .map(MapChanges::duplicate)
        {
            tx.install_layer(&copy, layer);
        }
        copy
    }
}

impl<K, V> TransactionalLayerCreator for TransactionalMap<K, V>
where
    K: Hash + Eq + 'static,
    V: 'static,
{
    type Layer = MapChanges<K, V>;

    fn layer_id(&self) -> LayerId {
        self.id
    }

    fn create_layer(&self) -> Self::Layer {
        MapChanges::new()
    }
}

impl<K, V> TransactionalLayerProducer for TransactionalMap<K, V>
where
    K: Hash + Eq + TransactionalElement + 'static,
    V: TransactionalElement + 'static,
{
    fn create_copy_with_merged_transactional_memory(
        &self,
        layer: &Self::Layer,
        maintainer: &TransactionalLayerMaintainer<'_>,
    ) -> Self {
        let mut merged = create_map();
        merged.reserve(
            self.base.len() + layer.created_key_count() - layer.removed_key_count(),
        );
        for (key, value) in self.base.iter() {
            if layer.contains_removed(key) {
                continue;
            }
            let value = layer.get_updated(key).unwrap_or(value);
            merged.insert(
                key.committed_version(maintainer),
                value.committed_version(maintainer),
            );
        }
        for (key, value) in layer.created_entries() {
            merged.insert(
                key.committed_version(maintainer),
                value.committed_version(maintainer),
            );
        }
        // a new base is a new value: handles to the old one keep reading their own base
        Self::with_base(Arc::new(merged))
    }
}

impl<K, V> TransactionalElement for TransactionalMap<K, V>
where
    K: Hash + Eq + TransactionalElement + 'static,
    V: TransactionalElement + 'static,
{
    fn committed_version(&self, maintainer: &TransactionalLayerMaintainer<'_>) -> Self {
        maintainer.committed_copy_of(self)
    }
}

impl<K, V> fmt::Debug for TransactionalMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalMap")
            .field("id", &self.id)
            .field("base_len", &self.base.len())
            .finish()
    }
}

/// The effective contents of a [`TransactionalMap`] as seen from one transaction context.
pub struct MapView<'a, K, V> {
    base: &'a HashMap<K, V, TxRandomState>,
    layer: Option<&'a MapChanges<K, V>>,
}

impl<K, V> Clone for MapView<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for MapView<'_, K, V> {}

impl<'a, K, V> MapView<'a, K, V>
where
    K: Hash + Eq,
{
    pub fn len(&self) -> usize {
        match self.layer {
            None => self.base.len(),
            Some(layer) => {
                self.base.len() + layer.created_key_count() - layer.removed_key_count()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self.layer {
            Some(layer) if !layer.is_empty() => self.len() == 0,
            _ => self.base.is_empty(),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&'a V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(layer) = self.layer else {
            return self.base.get(key);
        };
        if let Some(value) = layer.get_created(key) {
            return Some(value);
        }
        if layer.contains_removed(key) {
            return None;
        }
        layer.get_updated(key).or_else(|| self.base.get(key))
    }

    /// Yields pending creations first, then every visible base entry with its current value.
    pub fn iter(&self) -> Iter<'a, K, V> {
        Iter {
            created: self.layer.map(|layer| layer.created().iter()),
            base: self.base.iter(),
            layer: self.layer,
        }
    }
}

impl<'b, K, V> PartialEq<MapView<'b, K, V>> for MapView<'_, K, V>
where
    K: Hash + Eq,
    V: PartialEq,
{
    fn eq(&self, other: &MapView<'b, K, V>) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(key, value)| other.get(key).is_some_and(|theirs| theirs == value))
    }
}

impl<K, V> Eq for MapView<'_, K, V>
where
    K: Hash + Eq,
    V: Eq,
{
}

impl<K, V> Hash for MapView<'_, K, V>
where
    K: Hash + Eq,
    V: Hash,
{
    fn hash<H: Hasher>(&self, state: &mut H) {
        // entry order is unspecified, so combine per-entry hashes commutatively
        let combined = self
            .iter()
            .map(|entry| DETERMINISTIC_HASHER.hash_one(entry))
            .fold(0u64, u64::wrapping_add);
        state.write_usize(self.len());
        state.write_u64(combined);
    }
}

impl<K, V> fmt::Debug for MapView<'_, K, V>
where
    K: Hash + Eq + fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> fmt::Display for MapView<'_, K, V>
where
    K: Hash + Eq + fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl<'a, K, V> IntoIterator for MapView<'a, K, V>
where
    K: Hash + Eq,
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the effective entries of a [`TransactionalMap`].
pub struct Iter<'a, K, V> {
    created: Option<hash_map::Iter<'a, K, V>>,
    base: hash_map::Iter<'a, K, V>,
    layer: Option<&'a MapChanges<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: Hash + Eq,
{
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.created.as_mut().and_then(|created| created.next()) {
            return Some(entry);
        }
        let Some(layer) = self.layer else {
            return self.base.next();
        };
        self.base.find_map(|(key, value)| {
            if layer.contains_removed(key) || layer.get_created(key).is_some() {
                None
            } else {
                Some((key, layer.get_updated(key).unwrap_or(value)))
            }
        })
    }
}

impl<K, V> FusedIterator for Iter<'_, K, V> where K: Hash + Eq {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransactionalSet;
    use std::{cell::RefCell, rc::Rc};

    fn entries(
        map: &TransactionalMap<&'static str, u32>,
        tx: &TransactionContext,
    ) -> Vec<(&'static str, u32)> {
        let mut entries: Vec<_> = map.iter(tx).map(|(k, v)| (*k, *v)).collect();
        entries.sort();
        entries
    }

    #[test]
    fn insert_and_remove_inside_scope() {
        let mut tx = TransactionContext::new();
        let mut map = TransactionalMap::from_iter([("a", 1), ("b", 2)]);
        tx.open();

        assert_eq!(map.insert(&mut tx, "c", 3), None);
        assert_eq!(map.insert(&mut tx, "c", 4), Some(3));
        assert_eq!(map.insert(&mut tx, "a", 10), Some(1));
        assert_eq!(map.insert(&mut tx, "a", 11), Some(10));
        assert_eq!(map.remove(&mut tx, &"b"), Some(2));
        assert_eq!(map.remove(&mut tx, &"b"), None);
        assert_eq!(map.remove(&mut tx, &"missing"), None);

        assert_eq!(entries(&map, &tx), vec![("a", 11), ("c", 4)]);
        assert_eq!(map.len(&tx), 2);
        assert_eq!(map.base().len(), 2);
        assert_eq!(map.base().get("a"), Some(&1));
    }

    #[test]
    fn reinsert_after_remove() {
        let mut tx = TransactionContext::new();
        let mut map = TransactionalMap::from_iter([("a", 1)]);
        tx.open();
        assert_eq!(map.insert(&mut tx, "a", 5), Some(1));
        assert_eq!(map.remove(&mut tx, &"a"), Some(5));
        assert!(!map.contains_key(&tx, &"a"));
        assert_eq!(map.insert(&mut tx, "a", 6), None);
        assert_eq!(map.get(&tx, &"a"), Some(&6));
        assert_eq!(map.len(&tx), 1);
    }

    #[test]
    fn clear_inside_scope() {
        let mut tx = TransactionContext::new();
        let mut map = TransactionalMap::from_iter([("a", 1), ("b", 2)]);
        tx.open();
        map.insert(&mut tx, "c", 3);
        map.clear(&mut tx);
        assert!(map.is_empty(&tx));
        assert_eq!(map.iter(&tx).count(), 0);
        assert_eq!(map.base().len(), 2);
    }

    #[test]
    fn emptiness_follows_the_overlay() {
        let mut tx = TransactionContext::new();
        let mut map = TransactionalMap::from_iter([("a", 1)]);
        tx.open();
        assert!(!map.is_empty(&tx));
        map.remove(&mut tx, &"a");
        assert!(map.is_empty(&tx));
        map.insert(&mut tx, "a", 2);
        assert!(!map.is_empty(&tx));

        let mut empty = TransactionalMap::<&str, u32>::new();
        empty.insert(&mut tx, "b", 1);
        assert!(!empty.is_empty(&tx));
        empty.remove(&mut tx, &"b");
        assert!(empty.is_empty(&tx));
        assert!(empty.view(&tx).is_empty());
    }

    #[test]
    fn without_scope_mutates_base() {
        let mut tx = TransactionContext::new();
        let mut map = TransactionalMap::from_iter([("a", 1)]);
        assert_eq!(map.insert(&mut tx, "a", 2), Some(1));
        assert_eq!(map.remove(&mut tx, &"a"), Some(2));
        assert!(map.base().is_empty());
    }

    #[test]
    fn commit_merges_layer() {
        let mut tx = TransactionContext::new();
        let mut map = TransactionalMap::from_iter([("a", 1), ("b", 2)]);
        tx.open();
        map.insert(&mut tx, "a", 3);
        map.remove(&mut tx, &"b");
        map.insert(&mut tx, "c", 4);

        let committed = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&committed);
        let id = map.layer_id();
        tx.on_commit(move |maintainer| {
            *sink.borrow_mut() =
                maintainer.get_committed::<TransactionalMap<&'static str, u32>>(id);
        });
        tx.commit();

        let committed = committed.borrow_mut().take().unwrap();
        assert_eq!(entries(&committed, &tx), vec![("a", 3), ("c", 4)]);
        assert_eq!(entries(&map, &tx), vec![("a", 1), ("b", 2)]);
    }

    #[test]
    fn nested_transactional_values_commit_bottom_up() {
        let mut tx = TransactionContext::new();
        let mut index: TransactionalMap<&'static str, TransactionalSet<u32>> =
            TransactionalMap::new();
        tx.open();

        let mut postings = TransactionalSet::new();
        postings.add(&mut tx, 1);
        postings.add(&mut tx, 2);
        index.insert(&mut tx, "rust", postings.clone());
        postings.add(&mut tx, 3);

        let committed = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&committed);
        let id = index.layer_id();
        tx.on_commit(move |maintainer| {
            *sink.borrow_mut() = maintainer
                .get_committed::<TransactionalMap<&'static str, TransactionalSet<u32>>>(id);
        });
        let summary = tx.commit().unwrap();
        assert_eq!(summary.merged_layers, 2);

        let committed = committed.borrow_mut().take().unwrap();
        let postings = committed.get(&tx, &"rust").unwrap();
        let mut keys: Vec<_> = postings.base().iter().copied().collect();
        keys.sort();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn views_compare_by_effective_entries() {
        let mut tx = TransactionContext::new();
        let mut overlaid = TransactionalMap::from_iter([("a", 1), ("x", 9)]);
        let plain = TransactionalMap::from_iter([("a", 2), ("b", 3)]);
        tx.open();
        overlaid.insert(&mut tx, "a", 2);
        overlaid.insert(&mut tx, "b", 3);
        overlaid.remove(&mut tx, &"x");
        assert_eq!(overlaid.view(&tx), plain.view(&tx));

        overlaid.insert(&mut tx, "b", 4);
        assert_ne!(overlaid.view(&tx), plain.view(&tx));
    }

    #[test]
    fn duplicate_copies_layer() {
        let mut tx = TransactionContext::new();
        let mut map = TransactionalMap::from_iter([("a", 1)]);
        tx.open();
        map.insert(&mut tx, "b", 2);
        let mut copy = map.duplicate(&mut tx);
        copy.insert(&mut tx, "c", 3);
        assert_eq!(entries(&map, &tx), vec![("a", 1), ("b", 2)]);
        assert_eq!(entries(&copy, &tx), vec![("a", 1), ("b", 2), ("c", 3)]);
    }
}
