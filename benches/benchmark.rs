use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use order_dispatch::clock::VirtualClock;
use order_dispatch::config::DispatcherConfig;
use order_dispatch::dispatcher::Dispatcher;
use order_dispatch::orders::Priority;
use std::sync::Arc;

fn setup_dispatcher(orders: u64, bots: usize) -> (Dispatcher, Arc<VirtualClock>) {
    let clock = Arc::new(VirtualClock::new());
    let d = Dispatcher::new(DispatcherConfig::default().with_max_bots(bots), clock.clone());
    //every third order is VIP
    for i in 0..orders {
        let priority = if i % 3 == 0 { Priority::Vip } else { Priority::Normal };
        d.submit_order(priority);
    }
    (d, clock)
}

fn bench_dispatch(c: &mut Criterion) {
    let orders = 1_000;
    let bots = 16;

    c.bench_function("drain 1000 orders with 16 bots", |b| {
        b.iter_batched(
            || setup_dispatcher(orders, bots),
            |(d, clock)| {
                for _ in 0..bots {
                    let _ = d.add_bot();
                }
                clock.run_until_idle();
                d
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("submit into a saturated pool", |b| {
        let (d, _clock) = setup_dispatcher(0, 4);
        for _ in 0..4 {
            let _ = d.add_bot();
        }
        b.iter(|| d.submit_order(Priority::Normal))
    });

    c.bench_function("remove busy bot and re-add", |b| {
        let (d, _clock) = setup_dispatcher(100, 1);
        let _ = d.add_bot();
        b.iter(|| {
            d.remove_bot();
            d.add_bot()
        })
    });
}
criterion_group!(benches, bench_dispatch);
criterion_main!(benches);
