use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use merchant_memory::engine::dedup::{content_hash, jaccard, key_phrases, sequence_ratio};
use merchant_memory::engine::store::vector::cosine_similarity;

const LENGTHS: [usize; 3] = [40, 160, 640];

fn sentence(len: usize, salt: &str) -> String {
    let base = "Merchant ships handmade soy candles via FedEx Ground and restocks wax weekly ";
    let mut s = String::with_capacity(len + salt.len());
    while s.len() < len {
        s.push_str(base);
    }
    s.truncate(len);
    s.push_str(salt);
    s
}

fn layers(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_layers");

    for len in LENGTHS {
        let a = sentence(len, " alpha");
        let b = sentence(len, " bravo");
        group.throughput(Throughput::Bytes(len as u64));

        group.bench_function(BenchmarkId::new("exact_hash", len), |bench| {
            bench.iter(|| content_hash(black_box(&a)))
        });
        group.bench_function(BenchmarkId::new("fuzzy_ratio", len), |bench| {
            bench.iter(|| sequence_ratio(black_box(&a), black_box(&b)))
        });
        group.bench_function(BenchmarkId::new("key_phrase_jaccard", len), |bench| {
            bench.iter(|| jaccard(&key_phrases(black_box(&a)), &key_phrases(black_box(&b))))
        });
    }

    group.finish();
}

fn semantic(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_semantic");
    for dims in [384usize, 768, 1536] {
        let a: Vec<f32> = (0..dims).map(|i| (i as f32 * 0.37).sin()).collect();
        let b: Vec<f32> = (0..dims).map(|i| (i as f32 * 0.41).cos()).collect();
        group.bench_function(BenchmarkId::new("cosine", dims), |bench| {
            bench.iter(|| cosine_similarity(black_box(&a), black_box(&b)))
        });
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default();
    targets = layers, semantic
);

criterion_main!(benches);
