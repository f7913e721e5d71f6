// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # txmem: Transactional Memory Layers for Shared In-Memory Data
//!
//! This crate provides the concurrency and isolation core of an in-memory indexed database: a
//! generic **transactional overlay** that lets many threads observe and mutate shared, long-lived
//! data structures (sets, maps, index nodes) as if each owned a private, consistent snapshot.
//! Changes become visible to anyone else only once a transaction commits and a consumer
//! publishes the newly committed value.
//!
//! There is no MVCC engine and no locking for reads. Isolation comes from two ingredients:
//!
//! - **Immutable base values.** A transactional structure wraps a base value behind an
//!   [`Arc`](std::sync::Arc). The base is never mutated in place while it is shared.
//! - **Private delta layers.** While a transaction is open, mutations land in a small delta
//!   layer (for example [`SetChanges`]) owned by the calling thread's [`TransactionContext`].
//!   Reads consult the pair `(layer, base)`.
//!
//! ## Core Concepts
//!
//! - [`TransactionContext`]: the per-thread stack of transaction scopes. It is created
//!   explicitly and passed by reference into every transactional operation, so there is no
//!   hidden thread-local state. The context is `!Send` and `!Sync`, which means in-flight
//!   layers cannot leak to another thread.
//! - [`TransactionalLayerCreator`], [`TransactionalLayerProducer`] and
//!   [`TransactionalLayerConsumer`]: the three capability contracts any data structure (or
//!   publisher) implements to opt into transactionality.
//! - [`TransactionalSet`] and [`TransactionalMap`]: worked exemplars of the pattern.
//! - [`Published`]: a reference slot that consumers swap committed values into.
//!
//! ## Getting Started
//!
//! ```rust
//! use txmem::{Published, TransactionContext, TransactionalSet};
//!
//! let published = Published::new(TransactionalSet::from_iter(["c", "d"]));
//! let before = published.load();
//!
//! let mut tx = TransactionContext::new();
//! tx.open();
//! tx.add_transaction_commit_handler(published.consumer());
//!
//! let mut set = (*published.load()).clone();
//! set.add(&mut tx, "a");
//! set.add(&mut tx, "b");
//! set.remove(&mut tx, &"c");
//! assert_eq!(set.len(&tx), 3);
//!
//! // Nobody else sees the change until commit.
//! assert!(published.load().contains(&TransactionContext::new(), &"c"));
//!
//! tx.commit();
//! let after = published.load();
//! let outside = TransactionContext::new();
//! assert!(after.contains(&outside, &"a"));
//! assert!(!after.contains(&outside, &"c"));
//!
//! // A reference to the pre-commit value still reads the old state.
//! assert!(before.contains(&outside, &"c"));
//! ```
//!
//! ## Nested Transactions
//!
//! [`TransactionContext::open_nested`] pushes a scope that can see (and mutate) every layer the
//! parent already materialized. Those shared layers are **not** isolated: rolling back the nested
//! scope leaves the parent's layers, including the nested mutations made to them, in place. Only
//! structures that materialize their first layer inside the nested scope are discarded.
//!
//! ## Publication and Races
//!
//! Commit produces brand-new base values and hands them to registered consumers. The crate does
//! not order or detect conflicts between two transactions that commit against the same base
//! snapshot. [`Published::compare_and_store`] lets a consumer refuse to overwrite a value that
//! changed underneath it; choosing between last-writer-wins, retry, or serialized commits is up
//! to the owning component.
//!
//! ## Features
//!
//! - `serde`: Provides `serde` support for delta layers and identifiers.
//! - `arbitrary`: Implements `quickcheck::Arbitrary` for operation generators, useful for
//!   property-based testing.
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

use ahash::RandomState;
use std::{
    collections::{HashMap, HashSet},
    hash::BuildHasher,
    sync::atomic::{AtomicBool, Ordering},
};

// Use a constant seed for hashing to make performance benchmarks have less variance.
pub(crate) const DETERMINISTIC_HASHER: RandomState = RandomState::with_seeds(48, 1516, 23, 42);

/// Macros usable for tests and initialization
pub mod macros;

pub mod layer;
pub use layer::{
    LayerId, TransactionalElement, TransactionalLayerConsumer, TransactionalLayerCreator,
    TransactionalLayerProducer,
};
pub mod transaction;
pub use transaction::{
    CommitSummary, TransactionContext, TransactionError, TransactionId, TransactionScope,
    TransactionalLayerMaintainer,
};
pub mod collections;
pub use collections::{
    map::TransactionalMap, map_changes::MapChanges, set::TransactionalSet,
    set_changes::SetChanges,
};
mod publish;
pub use publish::{PublishOnCommit, Published};
#[cfg(any(test, feature = "arbitrary"))]
pub mod test_util;

static ENABLE_DETERMINISM: AtomicBool = AtomicBool::new(false);

/// Makes all data structures behave deterministically.
///
/// This should only be enabled for testing, as it increases the odds of DoS
/// scenarios.
#[doc(hidden)]
pub fn enable_determinism() {
    ENABLE_DETERMINISM.store(true, Ordering::Release);
}

/// Checks if determinism is enabled.
///
/// Should be used internally and for testing.
#[doc(hidden)]
pub fn determinism_enabled() -> bool {
    ENABLE_DETERMINISM.load(Ordering::Acquire)
}

/// Create a random state for a hashmap.
/// If `enable_determinism` has been used, this will return a deterministic
/// decidedly non-random RandomState, useful in tests.
#[inline]
fn make_random_state() -> RandomState {
    if determinism_enabled() {
        DETERMINISTIC_HASHER
    } else {
        RandomState::new()
    }
}

fn create_map<K, V>() -> HashMap<K, V, TxRandomState> {
    HashMap::with_hasher(TxRandomState::default())
}

fn create_set<K>() -> HashSet<K, TxRandomState> {
    HashSet::with_hasher(TxRandomState::default())
}

fn create_set_with_capacity<K>(capacity: usize) -> HashSet<K, TxRandomState> {
    HashSet::with_capacity_and_hasher(capacity, TxRandomState::default())
}

/// This is a small wrapper around the standard RandomState.
/// This allows us to easily switch to a non-random RandomState for use in tests.
#[derive(Clone)]
pub struct TxRandomState {
    inner: RandomState,
}

// Falls back on regular ahash::RandomState except when 'enable_determinism' has been called, in
// which case a static only-for-test RandomState is used.
impl Default for TxRandomState {
    #[inline]
    fn default() -> Self {
        Self {
            inner: make_random_state(),
        }
    }
}

impl BuildHasher for TxRandomState {
    type Hasher = <RandomState as BuildHasher>::Hasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        self.inner.build_hasher()
    }
}
