// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Arbitrary transaction traces over a published [`TransactionalSet`].
//!
//! A [`TxTrace`] is replayed against the real machinery and, in lockstep, against a plain
//! [`BTreeSet`] model of what the committed and in-flight contents should be.

use crate::{Published, TransactionContext, TransactionalSet};
use quickcheck::{Arbitrary, Gen};
use std::collections::BTreeSet;

/// One step of a trace.
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    Open,
    Commit,
    Flush,
    Rollback,
    Add(u8),
    Remove(u8),
    Clear,
}

impl Arbitrary for TxOp {
    fn arbitrary(g: &mut Gen) -> Self {
        // small key space so removals and re-additions actually hit
        let key = u8::arbitrary(g) % 16;
        match u8::arbitrary(g) % 12 {
            0 | 1 => Self::Open,
            2 => Self::Commit,
            3 => Self::Flush,
            4 => Self::Rollback,
            5 => Self::Clear,
            6..=8 => Self::Add(key),
            _ => Self::Remove(key),
        }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        match *self {
            Self::Add(key) => Box::new(key.shrink().map(Self::Add)),
            Self::Remove(key) => Box::new(key.shrink().map(Self::Remove)),
            _ => quickcheck::empty_shrinker(),
        }
    }
}

/// A sequence of [`TxOp`]s.
///
/// Steps that make no sense at the point they occur (mutations with no open transaction, a
/// second `Open`) are skipped during replay, which keeps every shrunk trace executable.
#[derive(Debug, Clone, Default)]
pub struct TxTrace {
    pub ops: Vec<TxOp>,
}

impl Arbitrary for TxTrace {
    fn arbitrary(g: &mut Gen) -> Self {
        Self {
            ops: Vec::arbitrary(g),
        }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        Box::new(self.ops.shrink().map(|ops| Self { ops }))
    }
}

impl TxTrace {
    /// Replays the trace, returning a description of the first divergence from the model.
    pub fn check(&self) -> Result<(), String> {
        let published = Published::new(TransactionalSet::<u8>::new());
        let mut tx = TransactionContext::new();
        let mut set = (*published.load()).clone();
        let mut committed = BTreeSet::new();
        let mut working: Option<BTreeSet<u8>> = None;

        for (step, op) in self.ops.iter().enumerate() {
            match (*op, working.as_mut()) {
                (TxOp::Open, None) => {
                    tx.open();
                    tx.add_transaction_commit_handler(published.consumer());
                    set = (*published.load()).clone();
                    working = Some(committed.clone());
                }
                (TxOp::Add(key), Some(model)) => {
                    let (expected, actual) = (model.insert(key), set.add(&mut tx, key));
                    if expected != actual {
                        return Err(format!("step {step}: add({key}) returned {actual}"));
                    }
                }
                (TxOp::Remove(key), Some(model)) => {
                    let (expected, actual) = (model.remove(&key), set.remove(&mut tx, &key));
                    if expected != actual {
                        return Err(format!("step {step}: remove({key}) returned {actual}"));
                    }
                }
                (TxOp::Clear, Some(model)) => {
                    set.clear(&mut tx);
                    model.clear();
                }
                (TxOp::Commit, Some(_)) => {
                    tx.commit();
                    committed = working.take().unwrap_or_default();
                }
                (TxOp::Flush, Some(model)) => {
                    tx.flush();
                    committed = model.clone();
                    set = (*published.load()).clone();
                }
                (TxOp::Rollback, Some(_)) => {
                    tx.rollback();
                    working = None;
                }
                _ => continue,
            }

            let outside = TransactionContext::new();
            let visible: BTreeSet<u8> = published.load().iter(&outside).copied().collect();
            if visible != committed {
                return Err(format!(
                    "step {step}: published {visible:?}, expected {committed:?}"
                ));
            }
            if let Some(model) = &working {
                let inside: BTreeSet<u8> = set.iter(&tx).copied().collect();
                if &inside != model || set.len(&tx) != model.len() {
                    return Err(format!("step {step}: scope sees {inside:?}, expected {model:?}"));
                }
            }
        }
        tx.rollback();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[quickcheck]
    fn traces_match_model(trace: TxTrace) -> Result<(), String> {
        trace.check()
    }

    #[test]
    fn flush_then_commit() {
        use TxOp::*;
        let trace = TxTrace {
            ops: vec![Open, Add(1), Flush, Add(2), Remove(1), Commit, Open, Clear, Rollback],
        };
        assert_eq!(trace.check(), Ok(()));
    }
}
