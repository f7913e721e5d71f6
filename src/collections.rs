// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Transactional collections.
//!
//! Each collection follows the same pattern: an immutable, `Arc`-shared base value, a delta layer
//! type recording pending changes against it, and an implementation of the capability contracts
//! that lets the [`TransactionContext`](crate::TransactionContext) materialize, look up and fold
//! that layer.
//!
//! Reads consult `(layer, base)` together. Mutations go to the layer while a transaction is open
//! and fall back to copy-on-write mutation of the base otherwise.

pub mod map;
pub mod map_changes;
pub mod set;
pub mod set_changes;
