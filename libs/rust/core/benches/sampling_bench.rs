/// Client sampling and aggregation benchmarks
///
/// Run with: cargo bench --bench sampling_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fedsim_core::federated_learning::{weighted_mean, ClientContribution};
use fedsim_core::ClientSampler;

fn bench_sample(c: &mut Criterion) {
    let mut group = c.benchmark_group("client_sampler");
    for population in [100usize, 10_000, 342_477] {
        let ids: Vec<String> = (0..population).map(|i| format!("client_{i}")).collect();
        let sampler = ClientSampler::new(ids, 10, Some(1)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(population), &sampler, |b, s| {
            let mut round = 0u64;
            b.iter(|| {
                round += 1;
                black_box(s.sample(round));
            });
        });
    }
    group.finish();
}

fn bench_weighted_mean(c: &mut Criterion) {
    let contributions: Vec<ClientContribution> = (0..50)
        .map(|i| ClientContribution { client_id: format!("c{i}"), delta: vec![0.01 * i as f32; 10_000], weight: (i + 1) as f64 })
        .collect();
    c.bench_function("weighted_mean_50x10k", |b| {
        b.iter(|| black_box(weighted_mean(0, &contributions).unwrap()));
    });
}

criterion_group!(benches, bench_sample, bench_weighted_mean);
criterion_main!(benches);
