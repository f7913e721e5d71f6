// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use super::TransactionalLayerMaintainer;
use crate::{
    LayerId, TransactionalLayerConsumer, TransactionalLayerProducer, TxRandomState, create_map,
};
use smallvec::SmallVec;
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique, monotonically increasing identifier of a transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct TransactionId(u64);

impl TransactionId {
    fn next() -> Self {
        Self(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// A materialized layer together with the producer that knows how to fold it.
///
/// Type-erased so that one scope can hold layers of arbitrary structures.
pub(crate) trait ErasedLayer: Any {
    fn merge(&self, maintainer: &TransactionalLayerMaintainer<'_>) -> Box<dyn Any>;

    /// Rebases the slot onto `committed` and starts over with an empty layer.
    ///
    /// Handles carrying the slot's identity still hold the pre-flush base afterwards, so the
    /// slot is marked flushed and refuses further writes through them.
    fn reset(&mut self, committed: &dyn Any);

    fn is_flushed(&self) -> bool;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) struct LayerSlot<P: TransactionalLayerProducer> {
    producer: P,
    pub(crate) layer: P::Layer,
    flushed: bool,
}

impl<P: TransactionalLayerProducer> LayerSlot<P> {
    pub(crate) fn new(producer: &P) -> Self {
        Self {
            layer: producer.create_layer(),
            producer: producer.clone(),
            flushed: false,
        }
    }

    pub(crate) fn with_layer(producer: &P, layer: P::Layer) -> Self {
        Self {
            producer: producer.clone(),
            layer,
            flushed: false,
        }
    }
}

impl<P: TransactionalLayerProducer> ErasedLayer for LayerSlot<P> {
    fn merge(&self, maintainer: &TransactionalLayerMaintainer<'_>) -> Box<dyn Any> {
        Box::new(
            self.producer
                .create_copy_with_merged_transactional_memory(&self.layer, maintainer),
        )
    }

    fn reset(&mut self, committed: &dyn Any) {
        if let Some(committed) = committed.downcast_ref::<P>() {
            self.producer = committed.clone();
        }
        self.layer = self.producer.create_layer();
        self.flushed = true;
    }

    fn is_flushed(&self) -> bool {
        self.flushed
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) type LayerMap = HashMap<LayerId, Box<dyn ErasedLayer>, TxRandomState>;

/// Summary of a successful [`commit`](super::TransactionContext::commit) or
/// [`flush`](super::TransactionContext::flush).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    pub transaction_id: TransactionId,
    /// Number of layers folded into new committed values.
    pub merged_layers: usize,
    /// Number of consumers invoked.
    pub notified_consumers: usize,
}

/// One entry of a thread's transaction stack.
///
/// Owns the layers materialized while it was on top of the stack and the consumers registered
/// against it. A nested scope additionally sees the layers of the scope below it.
pub struct TransactionScope {
    id: TransactionId,
    nested: bool,
    pub(crate) layers: LayerMap,
    consumers: Vec<Box<dyn TransactionalLayerConsumer>>,
}

impl TransactionScope {
    /// Creates a fresh top-level scope.
    pub fn new() -> Self {
        Self::with_nesting(false)
    }

    pub(crate) fn with_nesting(nested: bool) -> Self {
        Self {
            id: TransactionId::next(),
            nested,
            layers: create_map(),
            consumers: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Whether this scope was seeded from a parent scope.
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// Number of layers materialized in this scope itself, not counting inherited ones.
    pub fn materialized_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub(crate) fn add_consumer(&mut self, consumer: Box<dyn TransactionalLayerConsumer>) {
        self.consumers.push(consumer);
    }

    /// Folds every visible layer and hands the result to the registered consumers.
    ///
    /// Returns the committed values keyed by creator so a flush can rebase its layers on them.
    pub(crate) fn publish(
        &mut self,
        parents: &[TransactionScope],
    ) -> (CommitSummary, HashMap<LayerId, Box<dyn Any>, TxRandomState>) {
        let Self {
            id,
            nested,
            layers,
            consumers,
        } = self;
        let maintainer =
            TransactionalLayerMaintainer::new(*id, visible_layers(layers, *nested, parents));
        let merged_layers = maintainer.merge_all();
        for consumer in consumers.iter_mut() {
            consumer.on_commit(&maintainer);
        }
        let summary = CommitSummary {
            transaction_id: *id,
            merged_layers,
            notified_consumers: consumers.len(),
        };
        (summary, maintainer.into_committed())
    }
}

impl Default for TransactionScope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.id)
            .field("nested", &self.nested)
            .field("layers", &self.layers.keys().collect::<Vec<_>>())
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

/// The layer maps visible from a scope, own layers first, then each parent it was seeded from.
pub(crate) fn visible_layers<'a>(
    own: &'a LayerMap,
    nested: bool,
    parents: &'a [TransactionScope],
) -> SmallVec<[&'a LayerMap; 4]> {
    let mut visible = SmallVec::new();
    visible.push(own);
    let mut inherits = nested;
    for parent in parents.iter().rev() {
        if !inherits {
            break;
        }
        visible.push(&parent.layers);
        inherits = parent.nested;
    }
    visible
}

/// Number of scopes at the top of `scopes` whose layers are visible from the topmost one.
pub(crate) fn visible_depth(scopes: &[TransactionScope]) -> usize {
    let mut depth = 0;
    for scope in scopes.iter().rev() {
        depth += 1;
        if !scope.nested {
            break;
        }
    }
    depth
}
