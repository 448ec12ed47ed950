use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

use std::sync::Arc;

use recycler::collection_flags::*;
use recycler::{CollectionFlags, DefaultCollectionHost, Options, Recycler};

fn bench_recycler() -> Recycler {
    let mut options = Options::default();
    options.set_bulk("concurrent=false,parallel_mark_worker_count=0,idle_decommit=false");
    Recycler::new(Arc::new(DefaultCollectionHost), options)
}

fn bench_alloc(c: &mut Criterion) {
    let r = bench_recycler();
    c.bench_function("alloc-32", |b| {
        b.iter(|| {
            std::hint::black_box(r.alloc(32));
        })
    });
    c.bench_function("alloc-leaf-256", |b| {
        b.iter(|| {
            std::hint::black_box(r.alloc_leaf(256));
        })
    });
}

fn bench_collect(c: &mut Criterion) {
    let flags = CollectionFlags(COLLECT_NOW_FORCE_IN_THREAD.0 | COLLECT_OVERRIDE_SKIP_STACK.0);
    c.bench_function("collect-10k-dead", |b| {
        b.iter_with_setup(
            || {
                let r = bench_recycler();
                for _ in 0..10_000 {
                    r.alloc_zero(48);
                }
                r
            },
            |r| {
                r.collect_now(flags);
            },
        )
    });
}

fn bench_main(c: &mut Criterion) {
    bench_alloc(c);
    bench_collect(c);
}

criterion_group!(benches, bench_main);
criterion_main!(benches);
