// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use crate::{TransactionalLayerConsumer, TransactionalLayerMaintainer, TransactionalLayerProducer};
use parking_lot::RwLock;
use std::{fmt, sync::Arc};
use tracing::{debug, warn};

/// A shared reference slot holding the currently published value of a transactional structure.
///
/// Readers take a cheap [`Arc`] snapshot with [`Published::load`]; a snapshot never changes, even
/// when a later commit publishes a new value. Cloning a `Published` yields another handle to the
/// same slot, so it can be handed to any number of threads.
pub struct Published<T> {
    slot: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for Published<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Published<T> {
    pub fn new(value: T) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Arc::new(value))),
        }
    }

    /// Returns the current value.
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.slot.read())
    }

    pub fn store(&self, value: T) {
        *self.slot.write() = Arc::new(value);
    }

    /// Publishes `value` and returns the value it replaced.
    pub fn replace(&self, value: T) -> Arc<T> {
        std::mem::replace(&mut *self.slot.write(), Arc::new(value))
    }

    /// Publishes `value` only if the slot still holds `expected`.
    ///
    /// Identity is pointer identity of the [`Arc`], not value equality.
    pub fn compare_and_store(&self, expected: &Arc<T>, value: T) -> bool {
        let mut current = self.slot.write();
        if !Arc::ptr_eq(&current, expected) {
            return false;
        }
        *current = Arc::new(value);
        true
    }

    /// Returns whether both handles refer to the same slot.
    pub fn same_slot(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<T> Published<T>
where
    T: TransactionalLayerProducer,
{
    /// A consumer that publishes the committed value of the current slot content.
    ///
    /// Last writer wins: the commit replaces whatever the slot holds at publish time.
    pub fn consumer(&self) -> PublishOnCommit<T> {
        PublishOnCommit {
            target: self.clone(),
            expected: None,
        }
    }

    /// A consumer that only publishes if the slot still holds the value it held now.
    ///
    /// If another transaction published in between, this commit is not published and a warning
    /// is logged.
    pub fn guarded_consumer(&self) -> PublishOnCommit<T> {
        PublishOnCommit {
            target: self.clone(),
            expected: Some(self.load()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Published<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Published").field(&*self.load()).finish()
    }
}

/// Commit consumer created by [`Published::consumer`] and [`Published::guarded_consumer`].
pub struct PublishOnCommit<T> {
    target: Published<T>,
    expected: Option<Arc<T>>,
}

impl<T> TransactionalLayerConsumer for PublishOnCommit<T>
where
    T: TransactionalLayerProducer,
{
    fn on_commit(&mut self, maintainer: &TransactionalLayerMaintainer<'_>) {
        let current = self.target.load();
        let expected = self.expected.as_ref().unwrap_or(&current);
        // the published value is only ever replaced, never mutated, so its identity is stable
        let Some(committed) = maintainer.get_committed::<T>(expected.layer_id()) else {
            return;
        };
        if self.target.compare_and_store(expected, committed) {
            debug!(
                transaction = %maintainer.transaction_id(),
                layer = %expected.layer_id(),
                "published committed value"
            );
        } else {
            warn!(
                transaction = %maintainer.transaction_id(),
                layer = %expected.layer_id(),
                "not publishing: value was replaced concurrently"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TransactionContext, TransactionalSet};

    fn sorted(set: &TransactionalSet<u32>) -> Vec<u32> {
        let mut keys: Vec<_> = set.base().iter().copied().collect();
        keys.sort();
        keys
    }

    #[test]
    fn replace_and_compare() {
        let published = Published::new(1);
        let first = published.load();
        assert_eq!(*published.replace(2), 1);
        assert!(!published.compare_and_store(&first, 3));
        let second = published.load();
        assert!(published.compare_and_store(&second, 4));
        assert_eq!(*published.load(), 4);
        assert_eq!(*first, 1);
    }

    #[test]
    fn consumer_publishes_on_commit() {
        let published = Published::new(TransactionalSet::from_iter([1u32]));
        let mut tx = TransactionContext::new();
        tx.open();
        tx.add_transaction_commit_handler(published.consumer());
        let mut set = (*published.load()).clone();
        set.add(&mut tx, 2);
        tx.commit();
        assert_eq!(sorted(&published.load()), vec![1, 2]);
    }

    #[test]
    fn consumer_skips_untouched_values() {
        let published = Published::new(TransactionalSet::from_iter([1u32]));
        let before = published.load();
        let mut tx = TransactionContext::new();
        tx.open();
        tx.add_transaction_commit_handler(published.consumer());
        tx.commit();
        assert!(Arc::ptr_eq(&before, &published.load()));
    }

    #[test]
    fn guarded_consumer_refuses_stale_publish() {
        let published = Published::new(TransactionalSet::from_iter([1u32]));
        let mut tx = TransactionContext::new();
        tx.open();
        tx.add_transaction_commit_handler(published.guarded_consumer());
        let mut set = (*published.load()).clone();
        set.add(&mut tx, 2);

        published.store(TransactionalSet::from_iter([7u32]));
        tx.commit();
        assert_eq!(sorted(&published.load()), vec![7]);
    }

    #[test]
    fn clones_share_slot() {
        let published = Published::new("a");
        let handle = published.clone();
        handle.store("b");
        assert!(published.same_slot(&handle));
        assert_eq!(*published.load(), "b");
    }
}
