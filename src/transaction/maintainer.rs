// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use super::TransactionId;
use super::scope::{ErasedLayer, LayerMap, LayerSlot};
use crate::{LayerId, TransactionalLayerProducer, TxRandomState, create_map, create_set};
use smallvec::SmallVec;
use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
};

/// Commit-time view over the layers of a transaction scope.
///
/// Producers receive it to resolve nested transactional values; consumers receive it to pull the
/// committed values they publish. Committed values are folded lazily and memoized, so every layer
/// is merged exactly once per commit no matter how many times it is requested.
pub struct TransactionalLayerMaintainer<'a> {
    transaction_id: TransactionId,
    layers: SmallVec<[&'a LayerMap; 4]>,
    committed: RefCell<HashMap<LayerId, Box<dyn Any>, TxRandomState>>,
    in_progress: RefCell<SmallVec<[LayerId; 4]>>,
}

impl<'a> TransactionalLayerMaintainer<'a> {
    pub(crate) fn new(transaction_id: TransactionId, layers: SmallVec<[&'a LayerMap; 4]>) -> Self {
        Self {
            transaction_id,
            layers,
            committed: RefCell::new(create_map()),
            in_progress: RefCell::new(SmallVec::new()),
        }
    }

    /// The transaction being committed.
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Identities of every creator with a materialized layer, including inherited ones.
    pub fn layer_ids(&self) -> impl Iterator<Item = LayerId> + '_ {
        let mut seen = create_set();
        self.layers
            .iter()
            .flat_map(|layers| layers.keys().copied())
            .filter(move |id| seen.insert(*id))
    }

    pub fn contains_layer(&self, id: LayerId) -> bool {
        self.layers.iter().any(|layers| layers.contains_key(&id))
    }

    /// Returns the uncommitted layer of `creator`, if it has one.
    pub fn get_transactional_memory_layer_if_exists<P>(&self, creator: &P) -> Option<&'a P::Layer>
    where
        P: TransactionalLayerProducer,
    {
        let slot = self.find(creator.layer_id())?;
        slot.as_any()
            .downcast_ref::<LayerSlot<P>>()
            .map(|slot| &slot.layer)
    }

    /// Returns the committed value of the creator identified by `id`.
    ///
    /// `None` if that creator has no layer in this transaction (nothing changed), or if it is
    /// not a `P`.
    pub fn get_committed<P>(&self, id: LayerId) -> Option<P>
    where
        P: TransactionalLayerProducer,
    {
        if let Some(value) = self.committed.borrow().get(&id) {
            return value.downcast_ref::<P>().cloned();
        }
        let merged = self.merge_one(id)?;
        let value = merged.downcast_ref::<P>().cloned();
        self.committed.borrow_mut().insert(id, merged);
        value
    }

    /// Returns the committed copy of `value`, or a clone of it if it has no layer.
    pub fn committed_copy_of<P>(&self, value: &P) -> P
    where
        P: TransactionalLayerProducer,
    {
        self.get_committed(value.layer_id())
            .unwrap_or_else(|| value.clone())
    }

    /// Folds every visible layer that has not been folded yet. Returns the number of layers.
    pub(crate) fn merge_all(&self) -> usize {
        let ids: Vec<_> = self.layer_ids().collect();
        for &id in &ids {
            if self.committed.borrow().contains_key(&id) {
                continue;
            }
            if let Some(merged) = self.merge_one(id) {
                self.committed.borrow_mut().insert(id, merged);
            }
        }
        ids.len()
    }

    pub(crate) fn into_committed(self) -> HashMap<LayerId, Box<dyn Any>, TxRandomState> {
        self.committed.into_inner()
    }

    fn find(&self, id: LayerId) -> Option<&'a dyn ErasedLayer> {
        self.layers
            .iter()
            .copied()
            .find_map(|layers| layers.get(&id))
            .map(|slot| &**slot)
    }

    fn merge_one(&self, id: LayerId) -> Option<Box<dyn Any>> {
        // a value that (transitively) contains itself resolves to its pre-commit state
        if self.in_progress.borrow().contains(&id) {
            return None;
        }
        let slot = self.find(id)?;
        self.in_progress.borrow_mut().push(id);
        let merged = slot.merge(self);
        self.in_progress.borrow_mut().retain(|pending| *pending != id);
        tracing::trace!(transaction = %self.transaction_id, layer = %id, "merged layer");
        Some(merged)
    }
}
