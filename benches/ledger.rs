//! Benchmarks for in-flight ledger and admission throughput

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quota_gate::quota::{InflightLedger, LocalLedger, ManualMetering, QuotaConfigStore};
use quota_gate::{GatewayBackend, QuotaSettings};
use std::sync::Arc;
use std::time::Duration;

fn benchmark_reserve_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_reserve_commit");

    for buckets in [1, 16, 256].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(buckets), buckets, |b, &buckets| {
            let ledger = LocalLedger::new(Duration::from_secs(3600));
            let names: Vec<String> = (0..buckets).map(|i| format!("bucket-{}", i)).collect();
            let mut i = 0usize;
            b.iter(|| {
                let name = &names[i % names.len()];
                i += 1;
                let handle = ledger.reserve(name, black_box(4096));
                ledger.commit(&handle).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_reserve_within(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_reserve_within");

    group.bench_function("admit_and_rollback", |b| {
        let ledger = LocalLedger::new(Duration::from_secs(5));
        b.iter(|| {
            let handle = ledger
                .reserve_within("bucket", black_box(100), black_box(1 << 30))
                .unwrap();
            ledger.rollback(&handle).unwrap();
        });
    });

    group.bench_function("overdraft", |b| {
        let ledger = LocalLedger::new(Duration::from_secs(5));
        ledger.reserve("bucket", 1000);
        b.iter(|| black_box(ledger.reserve_within("bucket", 100, 1000).is_err()));
    });

    group.finish();
}

fn benchmark_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_flush");

    for entries in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(entries), entries, |b, &entries| {
            b.iter(|| {
                let ledger = LocalLedger::new(Duration::ZERO);
                for i in 0..entries {
                    let handle = ledger.reserve(&format!("bucket-{}", i % 64), 512);
                    ledger.commit(&handle).unwrap();
                }
                black_box(ledger.flush());
            });
        });
    }

    group.finish();
}

fn benchmark_gated_put(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let settings = QuotaSettings::default();
    let ledger = Arc::new(LocalLedger::new(settings.reconciliation_window()));
    let backend = GatewayBackend::with_quota(Arc::new(ManualMetering::new()), ledger, &settings);
    backend.create_bucket("bench").unwrap();
    backend.catalog().set_quota("bench", u64::MAX / 2).unwrap();
    let body = Bytes::from(vec![0u8; 1024]);

    c.bench_function("gated_put_overwrite", |b| {
        b.iter(|| {
            runtime
                .block_on(backend.put_object("bench", "key", body.clone()))
                .unwrap()
        });
    });
}

criterion_group!(
    benches,
    benchmark_reserve_commit,
    benchmark_reserve_within,
    benchmark_flush,
    benchmark_gated_put
);
criterion_main!(benches);
