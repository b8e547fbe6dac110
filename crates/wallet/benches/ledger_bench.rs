use common::UserId;
use criterion::{Criterion, criterion_group, criterion_main};
use wallet::{InMemoryUserStore, WalletService};

fn bench_recharge_new_key(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let wallet = WalletService::new(InMemoryUserStore::new());
    let user = UserId::new(1);
    let mut n = 0u64;

    c.bench_function("wallet/recharge_new_key", |b| {
        b.iter(|| {
            n += 1;
            let key = format!("bench-{n}");
            rt.block_on(async {
                wallet.recharge(user, 10, &key, "").await.unwrap();
            });
        });
    });
}

fn bench_replayed_key(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let wallet = WalletService::new(InMemoryUserStore::new());
    let user = UserId::new(1);
    rt.block_on(async {
        wallet.recharge(user, 1_000, "seed", "").await.unwrap();
        wallet.consume(user, 10, "replayed", "").await.unwrap();
    });

    c.bench_function("wallet/replayed_key", |b| {
        b.iter(|| {
            rt.block_on(async {
                let update = wallet.consume(user, 10, "replayed", "").await.unwrap();
                assert!(update.replayed);
            });
        });
    });
}

fn bench_consume_until_empty(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("wallet/consume_100_from_fresh_wallet", |b| {
        b.iter(|| {
            rt.block_on(async {
                let wallet = WalletService::new(InMemoryUserStore::new());
                let user = UserId::new(1);
                wallet.recharge(user, 100, "seed", "").await.unwrap();
                for i in 0..100 {
                    wallet.consume(user, 1, &format!("o-{i}"), "").await.unwrap();
                }
            });
        });
    });
}

criterion_group!(benches, bench_recharge_new_key, bench_replayed_key, bench_consume_until_empty);
criterion_main!(benches);
