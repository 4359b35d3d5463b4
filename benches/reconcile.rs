//! Benchmarks for range conversion and batch reconciliation.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use tokio::time::Instant;

use destguard::config::{FirewallConfiguration, Mode};
use destguard::netfilter::MemoryEngine;
use destguard::range::range_of;
use destguard::store::AllowList;
use destguard::synchronizer::{expiry_for, Synchronizer};
use destguard::topology;

/// Distinct IPv4 addresses as raw bytes
fn generate_addresses(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let i = i as u32;
            vec![10, (i >> 16) as u8, (i >> 8) as u8, i as u8]
        })
        .collect()
}

/// CIDR literals of varying sizes, both families
fn generate_literals(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            if i % 2 == 0 {
                format!("{}.{}.0.0/{}", i % 256, (i / 256) % 256, 16 + (i % 17))
            } else {
                format!("2001:db8:{:x}::/{}", i % 65536, 48 + (i % 81))
            }
        })
        .collect()
}

fn bench_range_of(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_of");

    for size in [100, 1000, 10000] {
        let literals = generate_literals(size);
        group.bench_with_input(BenchmarkId::new("mixed", size), &literals, |b, literals| {
            b.iter(|| {
                for literal in literals {
                    black_box(range_of(literal).ok());
                }
            })
        });
    }

    group.finish();
}

fn bench_apply_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_batch");

    for size in [10, 100, 1000] {
        let addresses = generate_addresses(size);

        group.bench_with_input(BenchmarkId::new("new", size), &addresses, |b, addresses| {
            b.iter_with_setup(
                || {
                    let mut engine = MemoryEngine::new();
                    let topology =
                        topology::build(&mut engine, &FirewallConfiguration::new(Mode::Local))
                            .unwrap();
                    Synchronizer::new(engine, topology, AllowList::new())
                },
                |mut sync| black_box(sync.apply_batch(addresses, expiry_for(Instant::now(), 300))),
            )
        });

        group.bench_with_input(
            BenchmarkId::new("duplicate", size),
            &addresses,
            |b, addresses| {
                let mut engine = MemoryEngine::new();
                let topology =
                    topology::build(&mut engine, &FirewallConfiguration::new(Mode::Local))
                        .unwrap();
                let mut sync = Synchronizer::new(engine, topology, AllowList::new());
                sync.apply_batch(addresses, expiry_for(Instant::now(), 300));

                b.iter(|| black_box(sync.apply_batch(addresses, expiry_for(Instant::now(), 300))))
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_range_of, bench_apply_batch);
criterion_main!(benches);
