// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::hint::black_box;
use tango_bench::{IntoBenchmarks, benchmark_fn, tango_benchmarks, tango_main};
use txmem::{Published, TransactionContext, TransactionalMap, TransactionalSet};

fn set_benchmarks() -> impl IntoBenchmarks {
    txmem::enable_determinism();

    let mut rng = StdRng::seed_from_u64(0x7e57);
    let base: &'static TransactionalSet<u32> = Box::leak(Box::new(TransactionalSet::from_iter(
        (0..1024).map(|_| rng.random_range(0..4096)),
    )));
    let lookups: &'static [u32] = Box::leak(
        (0..64)
            .map(|_| rng.random_range(0..8192))
            .collect::<Vec<_>>()
            .into_boxed_slice(),
    );
    [
        benchmark_fn("set::contains::no-scope", move |b| {
            b.iter(move || {
                let tx = TransactionContext::new();
                let set = black_box(base);
                lookups.iter().filter(|key| set.contains(&tx, *key)).count()
            })
        }),
        benchmark_fn("set::contains::overlay", move |b| {
            b.iter(move || {
                let mut tx = TransactionContext::new();
                tx.open();
                let mut set = black_box(base).clone();
                set.add(&mut tx, 5000);
                set.remove(&mut tx, &7);
                let hits = lookups.iter().filter(|key| set.contains(&tx, *key)).count();
                tx.rollback();
                hits
            })
        }),
        benchmark_fn("set::iter::overlay", move |b| {
            b.iter(move || {
                let mut tx = TransactionContext::new();
                tx.open();
                let mut set = black_box(base).clone();
                set.add_all(&mut tx, 2000..2016);
                set.remove(&mut tx, &512);
                let sum: u64 = set.iter(&tx).map(|key| u64::from(*key)).sum();
                tx.rollback();
                sum
            })
        }),
        benchmark_fn("set::commit::small-delta", move |b| {
            b.iter(move || {
                let published = Published::new(black_box(base).clone());
                let mut tx = TransactionContext::new();
                tx.open();
                tx.add_transaction_commit_handler(published.consumer());
                let mut set = (*published.load()).clone();
                set.add(&mut tx, 4096);
                set.remove(&mut tx, &0);
                black_box(tx.commit())
            })
        }),
    ]
}

fn map_benchmarks() -> impl IntoBenchmarks {
    txmem::enable_determinism();

    let base: &'static TransactionalMap<u32, u64> = Box::leak(Box::new(
        TransactionalMap::from_iter((0..1024).map(|key| (key, u64::from(key)))),
    ));
    [
        benchmark_fn("map::insert::overlay", move |b| {
            b.iter(move || {
                let mut tx = TransactionContext::new();
                tx.open();
                let mut map = black_box(base).clone();
                for key in 0..32 {
                    map.insert(&mut tx, key * 64, 0);
                }
                let len = map.len(&tx);
                tx.rollback();
                len
            })
        }),
        benchmark_fn("map::commit::nested-values", move |b| {
            b.iter(move || {
                let mut tx = TransactionContext::new();
                tx.open();
                let mut index = TransactionalMap::<u32, TransactionalSet<u32>>::new();
                for key in 0..16 {
                    let mut postings = TransactionalSet::new();
                    postings.add_all(&mut tx, key..key + 4);
                    index.insert(&mut tx, key, postings);
                }
                black_box(tx.commit())
            })
        }),
    ]
}

fn context_benchmarks() -> impl IntoBenchmarks {
    [
        benchmark_fn("context::open-commit-empty", |b| {
            b.iter(|| {
                let mut tx = TransactionContext::new();
                tx.open();
                black_box(tx.commit())
            })
        }),
        benchmark_fn("context::open-nested-rollback", |b| {
            b.iter(|| {
                let mut tx = TransactionContext::new();
                tx.open();
                tx.open_nested();
                tx.rollback();
                black_box(tx.rollback())
            })
        }),
    ]
}

tango_benchmarks!(set_benchmarks(), map_benchmarks(), context_benchmarks());
tango_main!();
