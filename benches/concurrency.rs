//! Benchmarks for structured-concurrency primitives: scope open/close overhead,
//! fork/await round trips, and cancellation propagation.

use criterion::{black_box, criterion_group, Criterion};
use std::thread;
use std::time::Duration;

use structura::{fork, fork_, global_context, r#async, scoped};

fn bench_spawn_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_latency");

    group.bench_function("fork_noop", |b| {
        b.iter(|| {
            scoped(&global_context(), |scope| {
                let handle = fork(scope, || black_box(42)).unwrap();
                handle.await_handle()
            })
        })
    });

    group.bench_function("std_thread_spawn_noop", |b| {
        b.iter(|| {
            let handle = thread::spawn(|| black_box(42));
            handle.join().unwrap()
        })
    });

    group.bench_function("fork_light_work", |b| {
        b.iter(|| {
            scoped(&global_context(), |scope| {
                let handle = fork(scope, || {
                    let mut sum = 0u64;
                    for i in 0..100 {
                        sum += black_box(i);
                    }
                    sum
                })
                .unwrap();
                handle.await_handle()
            })
        })
    });

    group.finish();
}

fn bench_scope_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("scope_overhead");

    group.bench_function("empty_scope", |b| {
        b.iter(|| scoped(&global_context(), |_scope| black_box(())))
    });

    group.bench_function("scope_with_n_children", |b| {
        b.iter(|| {
            scoped(&global_context(), |scope| {
                for _ in 0..8 {
                    fork_(scope, || black_box(())).unwrap();
                }
                scope.wait();
            })
        })
    });

    group.finish();
}

fn bench_async_await(c: &mut Criterion) {
    let mut group = c.benchmark_group("async_await");

    group.bench_function("async_capture_success", |b| {
        b.iter(|| {
            scoped(&global_context(), |scope| {
                let handle = r#async(scope, || black_box(42)).unwrap();
                handle.await_handle()
            })
        })
    });

    group.finish();
}

fn bench_cancellation(c: &mut Criterion) {
    let mut group = c.benchmark_group("cancellation");

    group.bench_function("cancel_scope_and_wait_for", |b| {
        b.iter(|| {
            scoped(&global_context(), |scope| {
                fork_(scope, || {
                    std::thread::sleep(Duration::from_millis(50));
                })
                .unwrap();
                scope.cancel_scope();
                scope.wait_for(Duration::from_micros(1))
            })
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_spawn_latency,
    bench_scope_overhead,
    bench_async_await,
    bench_cancellation
);

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    benches();
    Criterion::default().configure_from_args().final_summary();
}
