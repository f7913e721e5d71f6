// (c) Copyright 2025 Helsing GmbH. All rights reserved.
/// Implements [`TransactionalElement`](crate::TransactionalElement) for plain value types.
///
/// Types passed here are committed as-is, without looking for nested transactional values.
///
/// ```rust
/// #[derive(Clone, PartialEq, Eq, Hash)]
/// struct Sku(u32);
///
/// txmem::transactional_element!(Sku);
///
/// let set = txmem::tx_set![Sku(1), Sku(2)];
/// # let _ = set;
/// ```
#[macro_export]
macro_rules! transactional_element {
    ($($ty:ty),* $(,)?) => {
        $( impl $crate::TransactionalElement for $ty {} )*
    };
}

/// Convenience macro for creating a [`TransactionalSet`](crate::TransactionalSet) whose base
/// holds the given elements.
///
/// ```rust
/// # use txmem::{tx_set, TransactionContext};
/// let set = tx_set!["a", "b"];
/// assert_eq!(set.len(&TransactionContext::new()), 2);
/// ```
#[macro_export]
macro_rules! tx_set {
    () => {
        $crate::TransactionalSet::new()
    };
    ($($k:expr),+ $(,)?) => {
        $crate::TransactionalSet::from_iter([$($k),+])
    };
}

/// Convenience macro for creating a [`TransactionalMap`](crate::TransactionalMap) whose base
/// holds the given entries.
///
/// ```rust
/// # use txmem::{tx_map, TransactionContext};
/// let map = tx_map! {
///     "apples" => 3u32,
///     "pears" => 5u32
/// };
/// assert_eq!(map.get(&TransactionContext::new(), &"pears"), Some(&5));
/// ```
#[macro_export]
macro_rules! tx_map {
    () => {
        $crate::TransactionalMap::new()
    };
    ($($k:expr => $v:expr),+ $(,)?) => {
        $crate::TransactionalMap::from_iter([$(($k, $v)),+])
    };
}
