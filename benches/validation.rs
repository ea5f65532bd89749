use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use kyroguard::{
    validate, validate_all, AuditStore, CorrelationId, EntityKey, InMemoryAuditStore,
    MetricRecord, OperationKind, SequenceValidator, ThresholdRule, ValidationRule,
};

fn seeded_store(keys: u32) -> InMemoryAuditStore {
    let store = InMemoryAuditStore::new();
    // One validated record per key, values 0..keys.
    for i in 0..keys {
        let record = MetricRecord::new(
            EntityKey::new(format!("server:{i}")).unwrap(),
            "server",
            "bench",
            f64::from(i),
            true,
            OperationKind::Update,
            CorrelationId::new(),
        );
        store.append(record).unwrap();
    }
    store
}

fn bench_threshold(c: &mut Criterion) {
    let raw = ThresholdRule::raw_difference(5.0);
    c.bench_function("threshold/raw_difference", |b| {
        b.iter(|| validate(black_box(16.0), black_box(19.5), raw));
    });

    let rules = [
        ThresholdRule::raw_difference(5.0),
        ThresholdRule::percent_change(25.0),
        ThresholdRule::not_equal_to(),
    ];
    c.bench_function("threshold/validate_all_3", |b| {
        b.iter(|| {
            validate_all(
                black_box(16.0),
                black_box(19.5),
                rules.iter().map(|r| r as &dyn ValidationRule),
            )
        });
    });
}

fn bench_sequence(c: &mut Criterion) {
    let store = seeded_store(256);
    let validator = SequenceValidator::default();
    let rule = ThresholdRule::raw_difference(3.0);

    // Each key's candidate is one above its recorded value.
    let items: Vec<(u32, f64)> = (0..256u32).map(|i| (i, f64::from(i) + 1.0)).collect();

    let mut group = c.benchmark_group("sequence");
    group.throughput(Throughput::Elements(items.len() as u64));
    group.bench_function("validate_batch_256_keys", |b| {
        b.iter(|| {
            validator
                .validate_batch(
                    &items,
                    |(_, v)| *v,
                    &store,
                    |(i, _)| EntityKey::new(format!("server:{i}")),
                    &rule,
                    None,
                )
                .unwrap()
        });
    });

    // Same key throughout: every item is compared to its predecessor in the batch.
    let chain: Vec<f64> = (0..256u32).map(|i| f64::from(i) * 2.0).collect();
    group.bench_function("validate_batch_chain_256", |b| {
        b.iter(|| {
            validator
                .validate_batch(&chain, |v| *v, &store, |_| EntityKey::new("server:chain"), &rule, None)
                .unwrap()
        });
    });
    group.finish();
}

criterion_group!(validation, bench_threshold, bench_sequence);
criterion_main!(validation);
