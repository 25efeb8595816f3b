use slabmap::{SlabHashMap, INVALID_BUF_INDEX};

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

fn bench_batch_activate(c: &mut Criterion) {
    let mut group = c.benchmark_group("slabmap: batch activate");

    for &size in [1usize << 10, 1 << 14, 1 << 17].iter() {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let keys: Vec<u64> = (0..size as u64).collect();

            b.iter_batched(
                || {
                    (
                        SlabHashMap::<u64>::new(size, &[]),
                        vec![INVALID_BUF_INDEX; size],
                        vec![false; size],
                    )
                },
                |(mut map, mut indices, mut masks)| {
                    map.activate(&keys, &mut indices, &mut masks).unwrap();
                    map
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_batch_find(c: &mut Criterion) {
    let mut group = c.benchmark_group("slabmap: batch find");

    for &size in [1usize << 10, 1 << 14, 1 << 17].iter() {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let keys: Vec<u64> = (0..size as u64).collect();

            let mut map = SlabHashMap::<u64>::new(size, &[]);
            let mut indices = vec![INVALID_BUF_INDEX; size];
            let mut masks = vec![false; size];
            map.activate(&keys, &mut indices, &mut masks).unwrap();

            b.iter(|| map.find(&keys, &mut indices, &mut masks))
        });
    }

    group.finish();
}

fn bench_batch_erase_reinsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("slabmap: batch erase + reinsert");

    for &size in [1usize << 10, 1 << 14].iter() {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let keys: Vec<u64> = (0..size as u64).collect();

            b.iter_batched(
                || {
                    let mut map = SlabHashMap::<u64>::new(size * 4, &[]);
                    let mut indices = vec![INVALID_BUF_INDEX; size];
                    let mut masks = vec![false; size];
                    map.activate(&keys, &mut indices, &mut masks).unwrap();

                    (map, indices, masks)
                },
                |(mut map, mut indices, mut masks)| {
                    map.erase(&keys, &mut masks);
                    map.activate(&keys, &mut indices, &mut masks).unwrap();
                    map
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_batch_activate,
    bench_batch_find,
    bench_batch_erase_reinsert
);
criterion_main!(benches);
