use checkout::{ReservationOperator, SystemClock};
use chrono::Duration;
use common::OrderId;
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{LineItem, StockKey};
use reservation_store::{InMemoryReservationStore, ReservationStore};

fn bench_reserve_single_line(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("operator/reserve_single_line", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryReservationStore::new();
                store
                    .set_stock_level(&StockKey::product("SKU-001"), 1_000)
                    .await
                    .unwrap();
                let operator = ReservationOperator::new(store, SystemClock);
                operator
                    .reserve_stock(
                        OrderId::new(),
                        &[LineItem::new("SKU-001", 1)],
                        Duration::minutes(15),
                    )
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_reserve_release_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("operator/reserve_release_cycle", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryReservationStore::new();
                store
                    .set_stock_level(&StockKey::product("SKU-001"), 10)
                    .await
                    .unwrap();
                let operator = ReservationOperator::new(store, SystemClock);
                let order_id = OrderId::new();
                operator
                    .reserve_stock(
                        order_id,
                        &[LineItem::new("SKU-001", 2)],
                        Duration::minutes(15),
                    )
                    .await
                    .unwrap();
                operator.release_stock(order_id).await.unwrap();
            });
        });
    });
}

fn bench_contended_last_unit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("operator/contended_last_unit_8_way", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryReservationStore::new();
                store
                    .set_stock_level(&StockKey::product("SKU-001"), 1)
                    .await
                    .unwrap();

                let mut handles = Vec::new();
                for _ in 0..8 {
                    let operator = ReservationOperator::new(store.clone(), SystemClock);
                    handles.push(tokio::spawn(async move {
                        operator
                            .reserve_stock(
                                OrderId::new(),
                                &[LineItem::new("SKU-001", 1)],
                                Duration::minutes(15),
                            )
                            .await
                    }));
                }
                for handle in handles {
                    let _ = handle.await.unwrap();
                }
            });
        });
    });
}

criterion_group!(
    benches,
    bench_reserve_single_line,
    bench_reserve_release_cycle,
    bench_contended_last_unit
);
criterion_main!(benches);
