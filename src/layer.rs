// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Capability contracts that let a data structure opt into transactional memory.
//!
//! A transactional type normally plays two roles at once: it is the data structure *and* the
//! [`TransactionalLayerCreator`] / [`TransactionalLayerProducer`] for its own delta layer. The
//! [`TransactionContext`](crate::TransactionContext) never inspects a layer; it only stores it,
//! hands it back to the owning structure, and at commit time asks the producer to fold it into a
//! new committed value. [`TransactionalLayerConsumer`]s then publish those values.
//!
//! All dispatch is static. Only types that implement the contracts can be passed to the
//! lookup, suppression and commit operations.

use crate::transaction::TransactionalLayerMaintainer;
use smallvec::SmallVec;
use std::{
    fmt,
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a creator for the purpose of layer lookup.
///
/// Every transactional object carries one. Clones of an object share it (they are handles to the
/// same logical structure), whereas duplicates receive a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct LayerId(u64);

impl LayerId {
    /// Allocates a process-wide unique identifier.
    pub fn next() -> Self {
        Self(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

/// Allocates empty delta layers.
pub trait TransactionalLayerCreator {
    /// The delta layer type recording pending changes against one base value.
    type Layer: 'static;

    /// The identity under which this creator's layer is kept in a transaction scope.
    fn layer_id(&self) -> LayerId;

    /// Returns a fresh layer with no pending changes.
    fn create_layer(&self) -> Self::Layer;

    /// Creators maintained internally by this object.
    ///
    /// Suppressing an object also suppresses everything listed here, so a composite structure
    /// can switch all of its parts to pass-through mode at once.
    fn maintained_creators(&self) -> SmallVec<[LayerId; 4]> {
        SmallVec::new()
    }
}

/// Folds a delta layer into a new committed value.
///
/// The committed value is a new object with a fresh [`LayerId`]. Handles to the pre-commit value
/// keep their identity, so a layer materialized later for the committed value is never applied
/// to an old base.
///
/// `Clone` must be cheap: the transaction scope keeps a clone of the producer as it was when its
/// layer was first materialized.
pub trait TransactionalLayerProducer: TransactionalLayerCreator + Clone + 'static {
    /// Builds a new, independent value containing the base state of `self` with `layer` applied.
    ///
    /// Must not mutate `self`. Nested transactional values are expected to be resolved via
    /// [`TransactionalLayerMaintainer::committed_copy_of`].
    fn create_copy_with_merged_transactional_memory(
        &self,
        layer: &Self::Layer,
        maintainer: &TransactionalLayerMaintainer<'_>,
    ) -> Self;
}

/// Commit-time callback that publishes committed values into longer-lived storage.
///
/// Invoked once per commit or flush, in registration order. Closures can be registered via
/// [`TransactionContext::on_commit`](crate::TransactionContext::on_commit).
pub trait TransactionalLayerConsumer {
    fn on_commit(&mut self, maintainer: &TransactionalLayerMaintainer<'_>);
}

/// Values stored inside transactional collections.
///
/// Plain values are committed as they are. A value that contains transactional structures
/// overrides [`TransactionalElement::committed_version`] to swap each of them for its committed
/// copy, which makes commits resolve nested transactional values bottom-up.
pub trait TransactionalElement: Clone {
    fn committed_version(&self, maintainer: &TransactionalLayerMaintainer<'_>) -> Self {
        let _ = maintainer;
        self.clone()
    }
}

crate::transactional_element!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    &'static str,
    Box<str>,
    Arc<str>,
    Rc<str>,
);

impl<T: TransactionalElement> TransactionalElement for Option<T> {
    fn committed_version(&self, maintainer: &TransactionalLayerMaintainer<'_>) -> Self {
        self.as_ref().map(|value| value.committed_version(maintainer))
    }
}

impl<T: TransactionalElement> TransactionalElement for Vec<T> {
    fn committed_version(&self, maintainer: &TransactionalLayerMaintainer<'_>) -> Self {
        self.iter()
            .map(|value| value.committed_version(maintainer))
            .collect()
    }
}

impl<A: TransactionalElement, B: TransactionalElement> TransactionalElement for (A, B) {
    fn committed_version(&self, maintainer: &TransactionalLayerMaintainer<'_>) -> Self {
        (
            self.0.committed_version(maintainer),
            self.1.committed_version(maintainer),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_ids_are_unique() {
        let a = LayerId::next();
        let b = LayerId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }

    #[test]
    fn layer_id_display() {
        insta::assert_snapshot!(LayerId(7), @"layer#7");
    }
}
