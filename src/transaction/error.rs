// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use crate::LayerId;
use thiserror::Error;

/// Contract violations raised by the transaction manager.
///
/// These are programmer errors rather than recoverable runtime conditions. They are raised before
/// any state is touched, so a failed call never leaves a partial layer or suppression behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// An operation that requires an open transaction was called outside of one.
    #[error("no transaction is open on this context")]
    NoActiveTransaction,

    /// Suppression was requested for a creator whose layer already exists in the active scope.
    #[error("cannot suppress {creator}: it already has a materialized layer in the active transaction")]
    LayerAlreadyMaterialized { creator: LayerId },

    /// A write went through a handle whose layer was flushed; the handle still holds the
    /// pre-flush base.
    #[error(
        "{creator} was flushed in the active transaction; reload it from where the commit published it"
    )]
    StaleHandle { creator: LayerId },
}
