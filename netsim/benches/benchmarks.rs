use criterion::{criterion_group, criterion_main, Criterion};
use netsim::simulations::{self, Settings};
use std::time::Duration;
use tokio::runtime::Runtime;

fn ping_pong(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let settings = Settings::default();
    c.bench_function("ping_pong", |b| {
        b.to_async(&runtime)
            .iter(|| async { simulations::ping_pong(settings).await.unwrap() })
    });
}

fn rip_line(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let settings = Settings {
        advertise_period: Duration::from_millis(10),
        ..Default::default()
    };
    let mut group = c.benchmark_group("routing");
    group.sample_size(10);
    group.bench_function("rip_line", |b| {
        b.to_async(&runtime)
            .iter(|| async { simulations::rip_line(settings).await.unwrap() })
    });
    group.finish();
}

criterion_group!(benches, ping_pong, rip_line);
criterion_main!(benches);
