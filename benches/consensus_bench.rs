use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parser::Params;
use radseq_assemble::consensus::call_consensus;
use radseq_assemble::estimate::ErrorHetEstimate;
use radseq_io::{Cluster, DerepRead, Orient};

fn make_cluster(depth: u32, length: usize) -> Cluster {
    let base = "ACGTACGTACGTACGTACGTACGTACGTACGT".repeat(length / 32 + 1);
    let sequence = base[..length].to_string();
    let mut rows: Vec<DerepRead> = (0..depth)
        .map(|i| DerepRead {
            name: format!("row{i}"),
            tag: None,
            size: 1,
            orient: if i == 0 { Orient::Seed } else { Orient::Plus },
            sequence: sequence.clone(),
        })
        .collect();
    // Sprinkle a few heterozygous sites so `infer_alleles` has real work to do.
    for row in rows.iter_mut().skip(depth as usize / 2) {
        row.sequence.replace_range(4..5, "G");
    }
    Cluster { rows }
}

fn bench_call_consensus(c: &mut Criterion) {
    let mut group = c.benchmark_group("consensus");
    let params = Params::default();
    let est = ErrorHetEstimate { heterozygosity: 0.01, error_rate: 0.001 };

    let shallow = make_cluster(8, 90);
    group.bench_function("shallow_cluster", |b| {
        b.iter(|| call_consensus(black_box(&shallow), black_box(&params), black_box(&est), false, None, 90));
    });

    let deep = make_cluster(80, 90);
    group.bench_function("deep_cluster", |b| {
        b.iter(|| call_consensus(black_box(&deep), black_box(&params), black_box(&est), false, None, 90));
    });

    group.finish();
}

criterion_group!(benches, bench_call_consensus);
criterion_main!(benches);
