use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use uuid::Uuid;

use coinledger::{Currency, CurrencyRegistry, EngineConfig, TransactionEngine};
use coinledger_memory::MemoryBackend;

fn engine() -> TransactionEngine {
    let registry = CurrencyRegistry::new(vec![Currency {
        name: Arc::from("coins"),
        symbol: "$".to_string(),
        decimals: 2,
        starting_balance: 0,
        overdraft: true,
        name_singular: "coin".to_string(),
        name_plural: "coins".to_string(),
    }])
    .unwrap();
    TransactionEngine::initialize(
        Arc::new(MemoryBackend::new()),
        Arc::new(registry),
        &EngineConfig::default(),
    )
    .unwrap()
}

fn bench_apply(c: &mut Criterion) {
    let engine = engine();
    let player = Uuid::from_u128(1);

    c.bench_function("apply_deposit", |b| {
        b.iter(|| engine.apply(black_box(player), "coins", 1, "bench", "deposit").unwrap())
    });

    engine.apply(player, "coins", 1, "bench", "warm").unwrap();
    c.bench_function("cached_balance_read", |b| {
        b.iter(|| engine.balance(black_box(player), "coins").unwrap())
    });

    let other = Uuid::from_u128(2);
    engine.apply(other, "coins", 1, "bench", "warm").unwrap();
    c.bench_function("transfer", |b| {
        b.iter(|| engine.transfer(black_box(player), other, "coins", 1, "bench", "move").unwrap())
    });
}

criterion_group!(benches, bench_apply);
criterion_main!(benches);
