// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The transaction manager.
//!
//! A [`TransactionContext`] owns a stack of [`TransactionScope`]s together with a stack of
//! suppression frames. It replaces implicit thread-bound storage: create one context per thread
//! (or per task) and pass it into every transactional operation.
//!
//! # Example
//!
//! ```
//! use txmem::{TransactionContext, TransactionalSet};
//!
//! let mut set = TransactionalSet::from_iter(["a", "b"]);
//! let mut tx = TransactionContext::new();
//!
//! tx.open();
//! set.add(&mut tx, "c");
//! set.remove(&mut tx, &"a");
//! assert!(set.contains(&tx, &"c"));
//!
//! // Throw the changes away; the base value was never touched.
//! tx.rollback();
//! assert!(set.contains(&tx, &"a"));
//! assert!(!set.contains(&tx, &"c"));
//! ```
//!
//! # Scope Semantics
//!
//! - **open**: pushes a fresh top-level scope.
//! - **open_nested**: pushes a scope seeded from the current top scope. Layers the parent already
//!   materialized are shared, not copied, so mutations to them survive a nested rollback.
//! - **commit**: pops the top scope, folds every visible layer into a new committed value and
//!   hands the values to each registered consumer in registration order. The scope is popped
//!   before merging starts, so a panicking producer never leaves a zombie scope behind.
//! - **flush**: like commit, but keeps the scope. Every flushed layer is rebased onto its
//!   committed value and restarted empty, so published changes are never applied twice.
//! - **rollback**: pops the top scope without invoking any producer or consumer.
//!
//! Commit, flush, rollback and consumer registration on an empty stack are no-ops: much calling
//! code is optionally transactional and must behave the same with or without an open scope.
//!
//! # Suppression
//!
//! [`TransactionContext::suppress_transactional_memory_layer_for`] disables layer creation for a
//! creator within a bounded region, which makes the structure fall back to direct mutation of its
//! base value (useful for bulk imports). Those direct mutations are not undone by a rollback.

mod error;
mod maintainer;
mod scope;
mod suppression;

pub use error::TransactionError;
pub use maintainer::TransactionalLayerMaintainer;
pub use scope::{CommitSummary, TransactionId, TransactionScope};

use crate::{
    LayerId, TransactionalLayerConsumer, TransactionalLayerCreator, TransactionalLayerProducer,
};
use scope::{ErasedLayer, LayerSlot, visible_depth};
use smallvec::{SmallVec, smallvec};
use std::fmt;
use suppression::SuppressionGuard;
use tracing::{debug, trace, warn};

/// A thread's stack of transaction scopes.
///
/// The context holds type-erased layers that are neither `Send` nor `Sync`, so the compiler keeps
/// every in-flight layer on the thread that created it.
#[derive(Default)]
pub struct TransactionContext {
    scopes: Vec<TransactionScope>,
    suppressed: Vec<SmallVec<[LayerId; 4]>>,
}

impl TransactionContext {
    /// Creates a context with no open transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether at least one scope is open.
    pub fn is_transaction_open(&self) -> bool {
        !self.scopes.is_empty()
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn current_transaction_id(&self) -> Option<TransactionId> {
        self.scopes.last().map(TransactionScope::id)
    }

    /// Returns the active scope, failing if there is none.
    ///
    /// For helpers that only make sense inside a transaction.
    pub fn require_active(&self) -> Result<&TransactionScope, TransactionError> {
        self.scopes
            .last()
            .ok_or(TransactionError::NoActiveTransaction)
    }

    /// Pushes a fresh top-level scope.
    pub fn open(&mut self) -> TransactionId {
        self.open_scope(TransactionScope::new())
    }

    /// Pushes a previously created scope, for example one returned by
    /// [`TransactionContext::rollback`].
    pub fn open_scope(&mut self, scope: TransactionScope) -> TransactionId {
        let id = scope.id();
        self.scopes.push(scope);
        debug!(transaction = %id, depth = self.scopes.len(), "opened transaction");
        id
    }

    /// Pushes a scope that shares every layer already materialized by the current top scope.
    ///
    /// Behaves like [`TransactionContext::open`] when no scope is open.
    pub fn open_nested(&mut self) -> TransactionId {
        let scope = TransactionScope::with_nesting(self.is_transaction_open());
        self.open_scope(scope)
    }

    /// Merges and publishes the top scope, then pops it.
    ///
    /// Returns `None` without doing anything if no scope is open.
    pub fn commit(&mut self) -> Option<CommitSummary> {
        let mut scope = self.scopes.pop()?;
        let (summary, _) = scope.publish(&self.scopes);
        debug!(
            transaction = %summary.transaction_id,
            layers = summary.merged_layers,
            consumers = summary.notified_consumers,
            "committed transaction"
        );
        Some(summary)
    }

    /// Merges and publishes the top scope but keeps it open.
    ///
    /// Every merged layer is rebased onto its committed value and reset to empty, while consumer
    /// registrations are kept. Returns `None` without doing anything if no scope is open.
    ///
    /// Handles held by the caller still point at their old base afterwards. Reload them from
    /// wherever the consumers published the committed values before mutating further; a write
    /// through a stale handle fails with [`TransactionError::StaleHandle`].
    pub fn flush(&mut self) -> Option<CommitSummary> {
        let (top, parents) = self.scopes.split_last_mut()?;
        let (summary, committed) = top.publish(parents);

        let len = self.scopes.len();
        let visible = visible_depth(&self.scopes);
        for (id, value) in committed {
            if let Some(slot) = self.scopes[len - visible..]
                .iter_mut()
                .rev()
                .find_map(|scope| scope.layers.get_mut(&id))
            {
                slot.reset(&*value);
            }
        }
        debug!(
            transaction = %summary.transaction_id,
            layers = summary.merged_layers,
            consumers = summary.notified_consumers,
            "flushed transaction"
        );
        Some(summary)
    }

    /// Pops and returns the top scope without merging anything.
    ///
    /// Returns `None` if no scope is open.
    pub fn rollback(&mut self) -> Option<TransactionScope> {
        let scope = self.scopes.pop()?;
        debug!(
            transaction = %scope.id(),
            layers = scope.materialized_layers(),
            "rolled back transaction"
        );
        Some(scope)
    }

    /// Registers `consumer` against the active scope.
    ///
    /// Returns `false`, registering nothing, if no scope is open.
    pub fn add_transaction_commit_handler<C>(&mut self, consumer: C) -> bool
    where
        C: TransactionalLayerConsumer + 'static,
    {
        match self.scopes.last_mut() {
            Some(scope) => {
                scope.add_consumer(Box::new(consumer));
                true
            }
            None => false,
        }
    }

    /// Registers a closure as a consumer of the active scope.
    ///
    /// Same contract as [`TransactionContext::add_transaction_commit_handler`].
    pub fn on_commit<F>(&mut self, consumer: F) -> bool
    where
        F: FnMut(&TransactionalLayerMaintainer<'_>) + 'static,
    {
        self.add_transaction_commit_handler(FnConsumer(consumer))
    }

    /// Returns the layer of `creator`, materializing it in the active scope on first use.
    ///
    /// `None` if no scope is open or `creator` is currently suppressed; the caller is then
    /// expected to operate on its base value directly.
    ///
    /// # Panics
    ///
    /// If the layer of `creator` was flushed in a visible scope. See
    /// [`TransactionContext::try_get_transactional_memory_layer`].
    pub fn get_transactional_memory_layer<P>(&mut self, creator: &P) -> Option<&mut P::Layer>
    where
        P: TransactionalLayerProducer,
    {
        self.try_get_transactional_memory_layer(creator)
            .unwrap_or_else(|error| panic!("{error}"))
    }

    /// Fallible form of [`TransactionContext::get_transactional_memory_layer`].
    ///
    /// Fails with [`TransactionError::StaleHandle`] if `creator` shares the identity of a layer
    /// that was flushed in a visible scope. Such a handle still holds the pre-flush base, so a
    /// write through it would be decided against the wrong base and never be published.
    pub fn try_get_transactional_memory_layer<P>(
        &mut self,
        creator: &P,
    ) -> Result<Option<&mut P::Layer>, TransactionError>
    where
        P: TransactionalLayerProducer,
    {
        let id = creator.layer_id();
        if self.scopes.is_empty() || self.is_suppressed(id) {
            return Ok(None);
        }
        let index = match self.scope_holding(id) {
            Some(index) => {
                self.ensure_writable(index, id)?;
                index
            }
            None => {
                let index = self.scopes.len() - 1;
                let scope = &mut self.scopes[index];
                scope.layers.insert(id, Box::new(LayerSlot::new(creator)));
                trace!(transaction = %scope.id(), layer = %id, "materialized layer");
                index
            }
        };
        Ok(self.layer_at_mut::<P>(index, id))
    }

    /// Returns the layer of `creator` if it was already materialized, without creating one.
    pub fn get_transactional_memory_layer_if_exists<P>(&self, creator: &P) -> Option<&P::Layer>
    where
        P: TransactionalLayerProducer,
    {
        let id = creator.layer_id();
        if self.is_suppressed(id) {
            return None;
        }
        let slot = self.scopes[self.scope_holding(id)?].layers.get(&id)?;
        Some(
            &slot
                .as_any()
                .downcast_ref::<LayerSlot<P>>()
                .expect("layer ids are unique to one creator type")
                .layer,
        )
    }

    /// Mutable counterpart of [`TransactionContext::get_transactional_memory_layer_if_exists`].
    ///
    /// # Panics
    ///
    /// Under the same condition as [`TransactionContext::get_transactional_memory_layer`].
    pub fn get_transactional_memory_layer_if_exists_mut<P>(
        &mut self,
        creator: &P,
    ) -> Option<&mut P::Layer>
    where
        P: TransactionalLayerProducer,
    {
        let id = creator.layer_id();
        if self.is_suppressed(id) {
            return None;
        }
        let index = self.scope_holding(id)?;
        if let Err(error) = self.ensure_writable(index, id) {
            panic!("{error}");
        }
        self.layer_at_mut::<P>(index, id)
    }

    /// Runs `body` with layer creation disabled for `creator` and every creator it maintains.
    ///
    /// Fails, before anything is pushed, if `creator` already has a layer visible from the active
    /// scope. The suppression is lifted on every exit path of `body`, including panics.
    pub fn suppress_transactional_memory_layer_for<C, R>(
        &mut self,
        creator: &C,
        body: impl FnOnce(&mut TransactionContext) -> R,
    ) -> Result<R, TransactionError>
    where
        C: TransactionalLayerCreator,
    {
        let id = creator.layer_id();
        if self.scope_holding(id).is_some() {
            return Err(TransactionError::LayerAlreadyMaterialized { creator: id });
        }
        let mut frame: SmallVec<[LayerId; 4]> = smallvec![id];
        frame.extend(creator.maintained_creators());
        trace!(creators = ?frame, "suppressing layer creation");
        self.suppressed.push(frame);

        let mut guard = SuppressionGuard::new(self);
        Ok(body(&mut guard))
    }

    /// Whether layer creation is currently disabled for the creator identified by `id`.
    pub fn is_suppressed(&self, id: LayerId) -> bool {
        self.suppressed.iter().any(|frame| frame.contains(&id))
    }

    /// Stores an already populated layer for `creator` in the active scope.
    ///
    /// Used when duplicating a structure so the copy starts with the same pending changes.
    /// Returns `false` if no scope is open or `creator` is suppressed.
    pub(crate) fn install_layer<P>(&mut self, creator: &P, layer: P::Layer) -> bool
    where
        P: TransactionalLayerProducer,
    {
        let id = creator.layer_id();
        if self.is_suppressed(id) {
            return false;
        }
        let Some(scope) = self.scopes.last_mut() else {
            return false;
        };
        scope
            .layers
            .insert(id, Box::new(LayerSlot::with_layer(creator, layer)));
        true
    }

    /// Index of the scope holding the layer of `id`, considering only scopes visible from the top.
    fn scope_holding(&self, id: LayerId) -> Option<usize> {
        let len = self.scopes.len();
        let visible = visible_depth(&self.scopes);
        (len - visible..len)
            .rev()
            .find(|&index| self.scopes[index].layers.contains_key(&id))
    }

    fn ensure_writable(&self, index: usize, id: LayerId) -> Result<(), TransactionError> {
        match self.scopes[index].layers.get(&id) {
            Some(slot) if slot.is_flushed() => {
                Err(TransactionError::StaleHandle { creator: id })
            }
            _ => Ok(()),
        }
    }

    fn layer_at_mut<P>(&mut self, index: usize, id: LayerId) -> Option<&mut P::Layer>
    where
        P: TransactionalLayerProducer,
    {
        let slot = self.scopes[index].layers.get_mut(&id)?;
        Some(
            &mut slot
                .as_any_mut()
                .downcast_mut::<LayerSlot<P>>()
                .expect("layer ids are unique to one creator type")
                .layer,
        )
    }
}

struct FnConsumer<F>(F);

impl<F> TransactionalLayerConsumer for FnConsumer<F>
where
    F: FnMut(&TransactionalLayerMaintainer<'_>),
{
    fn on_commit(&mut self, maintainer: &TransactionalLayerMaintainer<'_>) {
        (self.0)(maintainer)
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("scopes", &self.scopes)
            .field("suppressed", &self.suppressed)
            .finish()
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if !self.scopes.is_empty() {
            warn!(
                open = self.scopes.len(),
                "dropping transaction context with open scopes; their changes are discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransactionalSet;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn empty_stack_operations_are_no_ops() {
        let mut tx = TransactionContext::new();
        assert!(tx.commit().is_none());
        assert!(tx.commit().is_none());
        assert!(tx.rollback().is_none());
        assert!(tx.rollback().is_none());
        assert!(tx.flush().is_none());
        assert!(!tx.on_commit(|_| {}));
        assert_eq!(
            tx.require_active().unwrap_err(),
            TransactionError::NoActiveTransaction
        );
    }

    #[test]
    fn no_layer_without_scope() {
        let mut tx = TransactionContext::new();
        let set = TransactionalSet::<u32>::new();
        assert!(tx.get_transactional_memory_layer(&set).is_none());
        assert!(tx.get_transactional_memory_layer_if_exists(&set).is_none());
    }

    #[test]
    fn layer_is_materialized_once_per_scope() {
        let mut tx = TransactionContext::new();
        let set = TransactionalSet::<u32>::new();
        tx.open();
        assert!(tx.get_transactional_memory_layer_if_exists(&set).is_none());
        tx.get_transactional_memory_layer(&set)
            .unwrap()
            .register_created_key(1);
        let layer = tx.get_transactional_memory_layer(&set).unwrap();
        assert!(layer.contains_created(&1));
        assert_eq!(tx.require_active().unwrap().materialized_layers(), 1);
    }

    #[test]
    fn open_nested_on_empty_stack_is_top_level() {
        let mut tx = TransactionContext::new();
        tx.open_nested();
        assert!(!tx.require_active().unwrap().is_nested());
        tx.open_nested();
        assert!(tx.require_active().unwrap().is_nested());
        assert_eq!(tx.depth(), 2);
    }

    #[test]
    fn top_level_scope_does_not_see_lower_scopes() {
        let mut tx = TransactionContext::new();
        let set = TransactionalSet::<u32>::new();
        tx.open();
        tx.get_transactional_memory_layer(&set).unwrap();
        tx.open();
        assert!(tx.get_transactional_memory_layer_if_exists(&set).is_none());
        tx.open_nested();
        assert!(tx.get_transactional_memory_layer_if_exists(&set).is_none());
    }

    #[test]
    fn transaction_ids_increase() {
        let mut tx = TransactionContext::new();
        let first = tx.open();
        let second = tx.open_nested();
        assert!(second > first);
        assert_eq!(tx.current_transaction_id(), Some(second));
    }

    #[test]
    fn consumers_run_in_registration_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut tx = TransactionContext::new();
        tx.open();
        for n in 0..3 {
            let order = Rc::clone(&order);
            assert!(tx.on_commit(move |_| order.borrow_mut().push(n)));
        }
        let summary = tx.commit().unwrap();
        assert_eq!(summary.notified_consumers, 3);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert!(!tx.is_transaction_open());
    }

    #[test]
    fn rollback_returns_scope_that_can_be_reopened() {
        let mut tx = TransactionContext::new();
        let mut set = TransactionalSet::<u32>::new();
        let id = tx.open();
        set.add(&mut tx, 7);
        let scope = tx.rollback().unwrap();
        assert_eq!(scope.id(), id);
        assert!(!set.contains(&tx, &7));

        tx.open_scope(scope);
        assert!(set.contains(&tx, &7));
    }

    #[test]
    fn commit_pops_scope_even_if_producer_panics() {
        use crate::{TransactionalLayerCreator, TransactionalLayerProducer};

        #[derive(Clone)]
        struct Exploding(LayerId);

        impl TransactionalLayerCreator for Exploding {
            type Layer = ();

            fn layer_id(&self) -> LayerId {
                self.0
            }

            fn create_layer(&self) -> Self::Layer {}
        }

        impl TransactionalLayerProducer for Exploding {
            fn create_copy_with_merged_transactional_memory(
                &self,
                _layer: &Self::Layer,
                _maintainer: &TransactionalLayerMaintainer<'_>,
            ) -> Self {
                panic!("merge failed")
            }
        }

        let mut tx = TransactionContext::new();
        tx.open();
        let exploding = Exploding(LayerId::next());
        tx.get_transactional_memory_layer(&exploding).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tx.commit();
        }));
        assert!(result.is_err());
        assert!(!tx.is_transaction_open());
    }

    /// A composite whose parts are sets it maintains internally.
    struct Catalog {
        id: LayerId,
        names: TransactionalSet<&'static str>,
        prices: TransactionalSet<u32>,
    }

    impl TransactionalLayerCreator for Catalog {
        type Layer = ();

        fn layer_id(&self) -> LayerId {
            self.id
        }

        fn create_layer(&self) -> Self::Layer {}

        fn maintained_creators(&self) -> SmallVec<[LayerId; 4]> {
            smallvec![self.names.layer_id(), self.prices.layer_id()]
        }
    }

    #[test]
    fn suppression_covers_maintained_creators() {
        let mut tx = TransactionContext::new();
        let catalog = Catalog {
            id: LayerId::next(),
            names: TransactionalSet::new(),
            prices: TransactionalSet::new(),
        };
        let mut names = catalog.names.clone();
        let mut prices = catalog.prices.clone();
        tx.open();

        let added = tx
            .suppress_transactional_memory_layer_for(&catalog, |tx| {
                assert!(tx.is_suppressed(catalog.layer_id()));
                assert!(tx.get_transactional_memory_layer(&names).is_none());
                assert!(tx.get_transactional_memory_layer(&prices).is_none());
                names.add(tx, "bolt") & prices.add(tx, 3)
            })
            .unwrap();

        assert!(added);
        assert!(names.base().contains("bolt"));
        assert!(prices.base().contains(&3));
        assert!(!tx.is_suppressed(names.layer_id()));
        assert!(tx.get_transactional_memory_layer(&names).is_some());
        assert!(tx.get_transactional_memory_layer(&prices).is_some());
        assert_eq!(tx.require_active().unwrap().materialized_layers(), 2);
    }

    #[test]
    fn suppression_is_lifted_on_panic() {
        let mut tx = TransactionContext::new();
        let set = TransactionalSet::<u32>::new();
        let id = set.layer_id();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = tx.suppress_transactional_memory_layer_for(&set, |tx| -> u32 {
                assert!(tx.is_suppressed(id));
                panic!("bulk import failed")
            });
        }));
        assert!(result.is_err());
        assert!(!tx.is_suppressed(id));
    }
}
