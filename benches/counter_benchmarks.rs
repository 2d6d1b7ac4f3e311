use criterion::{criterion_group, criterion_main, Criterion};
use ratesync::counter::{CounterStore, FixedWindow};
use ratesync::sync::{apply_event, SyncEvent, WorkerId};
use std::hint::black_box;

fn benchmark_local_increment(c: &mut Criterion) {
    let store = CounterStore::new(FixedWindow::from_seconds(3600));

    c.bench_function("counter_local_increment", |b| {
        let mut counter = 0;
        b.iter(|| {
            counter += 1;
            let client_id = format!("10.0.{}.{}", (counter / 256) % 256, counter % 256);
            black_box(store.increment(&client_id))
        })
    });
}

fn benchmark_remote_apply(c: &mut Criterion) {
    let store = CounterStore::new(FixedWindow::from_seconds(3600));
    let me = WorkerId::new(1);
    let epoch = store.window().current_epoch();
    let events: Vec<SyncEvent> = (0..1000)
        .map(|i| SyncEvent::increment(format!("client_{}", i), WorkerId::new(2), epoch))
        .collect();

    c.bench_function("counter_remote_apply", |b| {
        let mut counter = 0;
        b.iter(|| {
            counter += 1;
            black_box(apply_event(me, &store, &events[counter % events.len()]))
        })
    });
}

fn benchmark_get(c: &mut Criterion) {
    let store = CounterStore::new(FixedWindow::from_seconds(3600));
    for i in 0..100 {
        store.increment(&format!("check_client_{}", i));
    }

    c.bench_function("counter_get", |b| {
        let mut counter = 0;
        b.iter(|| {
            counter += 1;
            let client_id = format!("check_client_{}", counter % 100);
            black_box(store.get(&client_id))
        })
    });
}

criterion_group!(
    benches,
    benchmark_local_increment,
    benchmark_remote_apply,
    benchmark_get
);
criterion_main!(benches);
