use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode};
use merkle_kv_mobile::anti_entropy::merkle::MerkleDigestTree;
use merkle_kv_mobile::model::StorageEntry;
use merkle_kv_mobile::store::{MemoryEngine, StorageEngine};
use std::time::Duration;

fn dataset(n: usize) -> Vec<StorageEntry> {
    (0..n)
        .map(|i| StorageEntry::new_set(format!("user:{i:06}"), "x".into(), 1000 + i as u64, "node-a".into(), i as u64))
        .collect()
}

fn bench_apply(c: &mut Criterion) {
    let mut g = c.benchmark_group("storage_apply");
    g.sample_size(60).measurement_time(Duration::from_secs(10)).warm_up_time(Duration::from_secs(2)).sampling_mode(SamplingMode::Auto);

    g.bench_function(BenchmarkId::new("apply", 100_000), |b| {
        b.iter(|| {
            let engine = MemoryEngine::new();
            for entry in dataset(100_000) {
                black_box(engine.apply(entry).unwrap());
            }
            black_box(engine.len());
        });
    });

    g.finish();
}

fn bench_merkle_build(c: &mut Criterion) {
    let entries = dataset(100_000);

    let mut g = c.benchmark_group("merkle_digest");
    g.sample_size(30).measurement_time(Duration::from_secs(10)).warm_up_time(Duration::from_secs(2)).sampling_mode(SamplingMode::Auto);

    g.bench_function(BenchmarkId::new("build", entries.len()), |b| {
        b.iter(|| {
            let tree = MerkleDigestTree::build(black_box(&entries)).unwrap();
            black_box(tree.root());
        });
    });

    g.finish();
}

criterion_group!(benches, bench_apply, bench_merkle_build);
criterion_main!(benches);
