// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use super::TransactionContext;
use std::ops::{Deref, DerefMut};

/// Keeps a suppression frame pushed for as long as it is alive.
///
/// The frame is popped on drop, which covers both the normal return of the guarded body and an
/// unwinding panic.
pub(crate) struct SuppressionGuard<'a> {
    context: &'a mut TransactionContext,
}

impl<'a> SuppressionGuard<'a> {
    pub(crate) fn new(context: &'a mut TransactionContext) -> Self {
        Self { context }
    }
}

impl Deref for SuppressionGuard<'_> {
    type Target = TransactionContext;

    fn deref(&self) -> &Self::Target {
        self.context
    }
}

impl DerefMut for SuppressionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.context
    }
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        let frame = self.context.suppressed.pop();
        tracing::trace!(creators = ?frame, "lifted layer suppression");
    }
}
