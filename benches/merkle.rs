//! Benchmarks for checkpoint construction.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use evidence_vault::checkpoint::{build_proof, merkle_root, signing_message, CheckpointSigner};
use evidence_vault::hash::sha256_hex;

fn leaves(n: usize) -> Vec<String> {
    (0..n).map(|i| sha256_hex(&(i as u64).to_le_bytes())).collect()
}

fn bench_merkle_root(c: &mut Criterion) {
    let mut group = c.benchmark_group("merkle_root");

    for count in [16, 256, 4096, 65536].iter() {
        let leaves = leaves(*count);
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| merkle_root(black_box(&leaves)))
        });
    }
    group.finish();
}

fn bench_inclusion_proof(c: &mut Criterion) {
    let mut group = c.benchmark_group("inclusion_proof");

    for count in [256, 4096].iter() {
        let leaves = leaves(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| build_proof(black_box(&leaves), black_box(count / 2)))
        });
    }
    group.finish();
}

fn bench_sign(c: &mut Criterion) {
    let signer = CheckpointSigner::generate().unwrap();
    let message = signing_message(&sha256_hex(b"root"), &chrono::Utc::now(), Some("previous"));
    c.bench_function("checkpoint_sign", |b| b.iter(|| signer.sign(black_box(&message))));
}

criterion_group!(benches, bench_merkle_root, bench_inclusion_proof, bench_sign);
criterion_main!(benches);
