// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use super::set_changes::SetChanges;
use crate::{
    DETERMINISTIC_HASHER, LayerId, TransactionContext, TransactionalElement,
    TransactionalLayerCreator, TransactionalLayerMaintainer, TransactionalLayerProducer,
    TxRandomState, create_set, create_set_with_capacity,
};
use std::{
    borrow::Borrow,
    collections::{HashSet, hash_set},
    fmt,
    hash::{BuildHasher, Hash, Hasher},
    iter::FusedIterator,
    sync::Arc,
};

/// A set whose reads and writes go through the delta layer of the active transaction.
///
/// The base set is shared behind an [`Arc`] and treated as immutable. While a transaction is
/// open on the [`TransactionContext`] passed in, mutations are recorded in a [`SetChanges`] layer
/// and reads consult `(layer, base)`. Without an open transaction (or while suppressed) the set
/// mutates its own base directly, copying it first if it is shared with anyone else.
///
/// Cloning yields another handle to the *same* logical set: both clones share a [`LayerId`] and
/// therefore the same layer. Use [`TransactionalSet::duplicate`] for an independent copy. The
/// value a commit produces is a new set with its own identity.
///
/// Mutating methods panic if the handle's layer was flushed; see
/// [`TransactionContext::flush`].
///
/// Equality, hashing and rendering are only available on the effective view returned by
/// [`TransactionalSet::view`], never on the raw base.
///
/// # Example
///
/// ```
/// use txmem::{TransactionContext, TransactionalSet};
///
/// let mut tx = TransactionContext::new();
/// let mut set = TransactionalSet::from_iter(["a", "b"]);
///
/// tx.open();
/// assert!(!set.add(&mut tx, "a"));
/// assert!(set.add(&mut tx, "c"));
/// assert!(set.remove(&mut tx, &"a"));
/// assert_eq!(set.view(&tx), TransactionalSet::from_iter(["b", "c"]).view(&tx));
/// ```
#[derive(Clone)]
pub struct TransactionalSet<K> {
    id: LayerId,
    base: Arc<HashSet<K, TxRandomState>>,
}

impl<K> TransactionalSet<K> {
    /// Creates an empty set with a fresh identity.
    pub fn new() -> Self {
        Self::with_base(Arc::new(create_set()))
    }

    /// Wraps an existing base set under a fresh identity.
    pub fn with_base(base: Arc<HashSet<K, TxRandomState>>) -> Self {
        Self {
            id: LayerId::next(),
            base,
        }
    }

    /// The committed base value, ignoring any pending changes.
    pub fn base(&self) -> &Arc<HashSet<K, TxRandomState>> {
        &self.base
    }
}

impl<K> Default for TransactionalSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> FromIterator<K> for TransactionalSet<K>
where
    K: Hash + Eq,
{
    fn from_iter<T: IntoIterator<Item = K>>(iter: T) -> Self {
        let mut base = create_set();
        base.extend(iter);
        Self::with_base(Arc::new(base))
    }
}

impl<K> TransactionalSet<K>
where
    K: Hash + Eq + TransactionalElement + 'static,
{
    /// Returns the overlay-aware view of this set as seen from `tx`.
    pub fn view<'a>(&'a self, tx: &'a TransactionContext) -> SetView<'a, K> {
        SetView {
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

    pub fn contains<Q>(&self, tx: &TransactionContext, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.view(tx).contains(key)
    }

    /// Iterates pending creations first, then the base elements that are still visible.
    pub fn iter<'a>(&'a self, tx: &'a TransactionContext) -> Iter<'a, K> {
        self.view(tx).iter()
    }

    /// Adds `key`. Returns whether visible membership changed.
    ///
    /// Re-adding a base element that is pending removal cancels the removal.
    pub fn add(&mut self, tx: &mut TransactionContext, key: K) -> bool {
        let Some(layer) = tx.get_transactional_memory_layer(self) else {
            return Arc::make_mut(&mut self.base).insert(key);
        };
        if layer.contains_created(&key) {
            return false;
        }
        if self.base.contains(&key) {
            return layer.remove_removed_key(&key);
        }
        layer.remove_removed_key(&key);
        layer.register_created_key(key)
    }

    /// Adds every key. Returns whether visible membership changed.
    pub fn add_all(
        &mut self,
        tx: &mut TransactionContext,
        keys: impl IntoIterator<Item = K>,
    ) -> bool {
        keys.into_iter()
            .fold(false, |changed, key| self.add(tx, key) | changed)
    }

    /// Removes `key`. Returns whether visible membership changed.
    pub fn remove<Q>(&mut self, tx: &mut TransactionContext, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(layer) = tx.get_transactional_memory_layer(self) else {
            return Arc::make_mut(&mut self.base).remove(key);
        };
        if layer.contains_removed(key) {
            return false;
        }
        if layer.remove_created_key(key) {
            return true;
        }
        match self.base.get(key) {
            Some(existing) => layer.register_removed_key(existing.clone()),
            None => false,
        }
    }

    /// Removes every element.
    pub fn clear(&mut self, tx: &mut TransactionContext) {
        match tx.get_transactional_memory_layer(self) {
            Some(layer) => layer.clear_all(self.base.iter().cloned()),
            None => self.base = Arc::new(create_set()),
        }
    }

    /// Keeps only the elements for which `keep` returns `true`.
    ///
    /// This is the transactional form of removing through an iterator: elements produced by the
    /// pending creations are un-created, base elements are marked removed, and the shared base
    /// is never mutated while a transaction is open.
    pub fn retain(&mut self, tx: &mut TransactionContext, mut keep: impl FnMut(&K) -> bool) {
        let Some(layer) = tx.get_transactional_memory_layer(self) else {
            Arc::make_mut(&mut self.base).retain(keep);
            return;
        };
        let uncreated: Vec<K> = layer
            .created_keys()
            .filter(|key| !keep(*key))
            .cloned()
            .collect();
        for key in &uncreated {
            layer.remove_created_key(key);
        }
        for key in self.base.iter() {
            if layer.contains_removed(key) || layer.contains_created(key) {
                continue;
            }
            if !keep(key) {
                layer.register_removed_key(key.clone());
            }
        }
    }

    /// Returns an independent copy under a fresh identity.
    ///
    /// If this set has a layer visible from `tx`, the copy receives a duplicate of it in the
    /// active scope, so both start out equal and can diverge afterwards.
    pub fn duplicate(&self, tx: &mut TransactionContext) -> Self {
        let copy = Self::with_base(Arc::clone(&self.base));
        if let Some(layer) = tx
            .get_transactional_memory_layer_if_exists(self)
            .map(SetChanges::duplicate)
        {
            tx.install_layer(&copy, layer);
        }
        copy
    }
}

impl<K> TransactionalLayerCreator for TransactionalSet<K>
where
    K: Hash + Eq + 'static,
{
    type Layer = SetChanges<K>;

    fn layer_id(&self) -> LayerId {
        self.id
    }

    fn create_layer(&self) -> Self::Layer {
        SetChanges::new()
    }
}

impl<K> TransactionalLayerProducer for TransactionalSet<K>
where
    K: Hash + Eq + TransactionalElement + 'static,
{
    fn create_copy_with_merged_transactional_memory(
        &self,
        layer: &Self::Layer,
        maintainer: &TransactionalLayerMaintainer<'_>,
    ) -> Self {
        let capacity = self.base.len().saturating_sub(layer.removed_key_count())
            + layer.created_key_count();
        let mut merged = create_set_with_capacity(capacity);
        merged.extend(
            self.base
                .iter()
                .filter(|key| !layer.contains_removed(*key))
                .map(|key| key.committed_version(maintainer)),
        );
        merged.extend(
            layer
                .created_keys()
                .map(|key| key.committed_version(maintainer)),
        );
        // a new base is a new value: handles to the old one keep reading their own base
        Self::with_base(Arc::new(merged))
    }
}

impl<K> TransactionalElement for TransactionalSet<K>
where
    K: Hash + Eq + TransactionalElement + 'static,
{
    fn committed_version(&self, maintainer: &TransactionalLayerMaintainer<'_>) -> Self {
        maintainer.committed_copy_of(self)
    }
}

impl<K> fmt::Debug for TransactionalSet<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalSet")
            .field("id", &self.id)
            .field("base_len", &self.base.len())
            .finish()
    }
}

/// The effective contents of a [`TransactionalSet`] as seen from one transaction context.
pub struct SetView<'a, K> {
    base: &'a HashSet<K, TxRandomState>,
    layer: Option<&'a SetChanges<K>>,
}

impl<K> Clone for SetView<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for SetView<'_, K> {}

impl<'a, K> SetView<'a, K>
where
    K: Hash + Eq,
{
    pub fn len(&self) -> usize {
        match self.layer {
            None => self.base.len(),
            Some(layer) => self.base.len() + layer.created_key_count() - layer.removed_key_count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self.layer {
            Some(layer) if !layer.is_empty() => self.len() == 0,
            _ => self.base.is_empty(),
        }
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.layer {
            Some(layer) if layer.contains_created(key) => true,
            Some(layer) if layer.contains_removed(key) => false,
            _ => self.base.contains(key),
        }
    }

    pub fn iter(&self) -> Iter<'a, K> {
        let inner = match self.layer {
            None => IterInner::Base(self.base.iter()),
            Some(layer) => IterInner::Overlay {
                created: layer.created().iter(),
                base: self.base.iter(),
                layer,
            },
        };
        Iter { inner }
    }
}

impl<'b, K> PartialEq<SetView<'b, K>> for SetView<'_, K>
where
    K: Hash + Eq,
{
    fn eq(&self, other: &SetView<'b, K>) -> bool {
        self.len() == other.len() && self.iter().all(|key| other.contains(key))
    }
}

impl<K> Eq for SetView<'_, K> where K: Hash + Eq {}

impl<K> Hash for SetView<'_, K>
where
    K: Hash + Eq,
{
    fn hash<H: Hasher>(&self, state: &mut H) {
        // element order is unspecified, so combine per-element hashes commutatively
        let combined = self
            .iter()
            .map(|key| DETERMINISTIC_HASHER.hash_one(key))
            .fold(0u64, u64::wrapping_add);
        state.write_usize(self.len());
        state.write_u64(combined);
    }
}

impl<K> fmt::Debug for SetView<'_, K>
where
    K: Hash + Eq + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<K> fmt::Display for SetView<'_, K>
where
    K: Hash + Eq + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl<'a, K> IntoIterator for SetView<'a, K>
where
    K: Hash + Eq,
{
    type Item = &'a K;
    type IntoIter = Iter<'a, K>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the effective contents of a [`TransactionalSet`].
///
/// Without a layer this is the base iterator, unmodified. With a layer it first yields every
/// pending creation, then every base element that is neither pending removal nor already yielded.
pub struct Iter<'a, K> {
    inner: IterInner<'a, K>,
}

enum IterInner<'a, K> {
    Base(hash_set::Iter<'a, K>),
    Overlay {
        created: hash_set::Iter<'a, K>,
        base: hash_set::Iter<'a, K>,
        layer: &'a SetChanges<K>,
    },
}

impl<'a, K> Iterator for Iter<'a, K>
where
    K: Hash + Eq,
{
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            IterInner::Base(base) => base.next(),
            IterInner::Overlay {
                created,
                base,
                layer,
            } => created.next().or_else(|| {
                base.find(|key| !layer.contains_removed(*key) && !layer.contains_created(*key))
            }),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            IterInner::Base(base) => base.size_hint(),
            IterInner::Overlay { created, base, .. } => {
                let (created_len, _) = created.size_hint();
                let (base_len, _) = base.size_hint();
                (created_len, Some(created_len + base_len))
            }
        }
    }
}

impl<K> FusedIterator for Iter<'_, K> where K: Hash + Eq {}
