//! BLOB engine benchmarks.
//!
//! Benchmarks for:
//! - create across payload sizes
//! - whole and ranged reads
//! - reference/dereference cycles
//! - compaction of a half-dead repository

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use nexus_bench::utils::{generate_payloads, BenchDb};
use nexus_blob::Metadata;
use nexus_common::types::RefId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Benchmark BLOB creation.
fn bench_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("blob/create");

    for size in [256usize, 4096, 64 * 1024, 1024 * 1024].iter() {
        let bench = BenchDb::new("create");
        let table = bench.db.table_or_create("t").unwrap();
        let payload = generate_payloads(1, *size).remove(0);

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let handle = bench.db.create_blob(table, &payload, Metadata::new()).unwrap();
                black_box(handle)
            });
        });
    }

    group.finish();
}

/// Benchmark whole-payload reads.
fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("blob/read");

    for size in [256usize, 4096, 64 * 1024, 1024 * 1024].iter() {
        let bench = BenchDb::new("read");
        let table = bench.db.table_or_create("t").unwrap();
        let handles: Vec<_> = generate_payloads(64, *size)
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let h = bench.db.create_blob(table, p, Metadata::new()).unwrap();
                bench.db.reference_blob(&h, table, 1, RefId::new(i as u64)).unwrap()
            })
            .collect();

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % handles.len();
                black_box(bench.db.read_blob(&handles[i], ..).unwrap())
            });
        });
    }

    group.finish();
}

/// Benchmark small ranged reads from a large BLOB.
fn bench_read_range(c: &mut Criterion) {
    let mut group = c.benchmark_group("blob/read_range");

    let bench = BenchDb::new("range");
    let table = bench.db.table_or_create("t").unwrap();
    let size = 4 * 1024 * 1024u64;
    let payload = generate_payloads(1, size as usize).remove(0);
    let handle = bench.db.create_blob(table, &payload, Metadata::new()).unwrap();
    let handle = bench.db.reference_blob(&handle, table, 1, RefId::new(1)).unwrap();

    for len in [512u64, 8192].iter() {
        let mut rng = StdRng::seed_from_u64(7);
        group.throughput(Throughput::Bytes(*len));
        group.bench_with_input(BenchmarkId::from_parameter(len), len, |b, &len| {
            b.iter(|| {
                let start = rng.gen_range(0..size - len);
                black_box(bench.db.read_blob(&handle, start..start + len).unwrap())
            });
        });
    }

    group.finish();
}

/// Benchmark one reference plus one dereference on a live BLOB.
fn bench_reference_cycle(c: &mut Criterion) {
    let bench = BenchDb::new("refs");
    let table = bench.db.table_or_create("t").unwrap();
    let handle = bench.db.create_blob(table, b"shared", Metadata::new()).unwrap();
    let handle = bench.db.reference_blob(&handle, table, 1, RefId::new(0)).unwrap();

    let mut row = 1u64;
    c.bench_function("blob/reference_cycle", |b| {
        b.iter(|| {
            row += 1;
            bench.db.reference_blob(&handle, table, 2, RefId::new(row)).unwrap();
            bench.db.dereference_blob(&handle, table, RefId::new(row)).unwrap();
        });
    });
}

/// Benchmark compacting a repository in which half the records are dead.
fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("blob/compaction");
    group.sample_size(10);

    group.bench_function("half_dead_1000x4k", |b| {
        b.iter_batched_ref(
            || {
                let bench = BenchDb::with_config("compact", |config| {
                    config
                        .with_garbage_threshold(10)
                        .with_temp_blob_timeout(std::time::Duration::ZERO)
                });
                let table = bench.db.table_or_create("t").unwrap();
                for (i, payload) in generate_payloads(1000, 4096).iter().enumerate() {
                    let h = bench.db.create_blob(table, payload, Metadata::new()).unwrap();
                    if i % 2 == 0 {
                        bench.db.reference_blob(&h, table, 1, RefId::new(i as u64)).unwrap();
                    }
                }
                bench.db.flush_deferred().unwrap();
                bench
            },
            |bench| black_box(bench.db.compact_now().unwrap()),
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_create,
    bench_read,
    bench_read_range,
    bench_reference_cycle,
    bench_compaction,
);
criterion_main!(benches);
