//! vmsync Benchmarks
//!
//! Fast paths of the execution token and object monitors, plus a full
//! exclusive-access round trip.
//! Run with: `cargo bench --package vmsync`

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use vmsync::{SyncConfig, SyncObject, SyncRuntime, VmThread};

fn create_runtime() -> (SyncRuntime, Arc<VmThread>) {
    let runtime = SyncRuntime::new(SyncConfig::default()).unwrap();
    let thread = runtime.attach_thread("bench");
    runtime.coordinator().acquire_access(&thread);
    (runtime, thread)
}

fn bench_access_token(c: &mut Criterion) {
    let (rt, t) = create_runtime();
    let vm = rt.coordinator();
    let mut group = c.benchmark_group("access_token");

    group.bench_function("release_acquire", |b| {
        b.iter(|| {
            vm.release_access(&t);
            vm.acquire_access(&t);
        })
    });

    group.bench_function("native_round_trip", |b| {
        b.iter(|| {
            vm.exit_to_native(&t);
            vm.enter_from_native(&t);
        })
    });

    group.bench_function("critical_region", |b| {
        b.iter(|| {
            vm.enter_critical(&t);
            vm.exit_critical(&t);
        })
    });

    group.finish();
}

fn bench_monitor_uncontended(c: &mut Criterion) {
    let (rt, t) = create_runtime();
    let mut group = c.benchmark_group("monitor_uncontended");
    group.throughput(Throughput::Elements(1));

    let plain = SyncObject::new();
    group.bench_function("thin_enter_exit", |b| {
        b.iter(|| {
            rt.enter(&t, black_box(&plain)).unwrap();
            rt.exit(&t, &plain).unwrap();
        })
    });

    let reserved = SyncObject::reservable();
    group.bench_function("reserved_enter_exit", |b| {
        b.iter(|| {
            rt.enter(&t, black_box(&reserved)).unwrap();
            rt.exit(&t, &reserved).unwrap();
        })
    });

    let nested = SyncObject::new();
    rt.enter(&t, &nested).unwrap();
    group.bench_function("recursive_enter_exit", |b| {
        b.iter(|| {
            rt.enter(&t, black_box(&nested)).unwrap();
            rt.exit(&t, &nested).unwrap();
        })
    });
    rt.exit(&t, &nested).unwrap();

    let inflated = SyncObject::new();
    rt.enter(&t, &inflated).unwrap();
    rt.wait(&t, &inflated, Some(std::time::Duration::from_millis(1))).unwrap();
    rt.exit(&t, &inflated).unwrap();
    group.bench_function("inflated_enter_exit", |b| {
        b.iter(|| {
            rt.enter(&t, black_box(&inflated)).unwrap();
            rt.exit(&t, &inflated).unwrap();
        })
    });

    group.finish();
}

fn bench_exclusive(c: &mut Criterion) {
    let (rt, t) = create_runtime();
    let mut group = c.benchmark_group("exclusive");

    group.bench_function("single_thread_round_trip", |b| {
        b.iter(|| {
            rt.coordinator().acquire_exclusive(&t);
            rt.coordinator().release_exclusive(&t);
        })
    });

    for idle in [4usize, 32] {
        let (rt, t) = create_runtime();
        let _idle: Vec<_> = (0..idle).map(|i| rt.attach_thread(format!("idle-{}", i))).collect();
        group.bench_function(format!("with_{}_idle_threads", idle), |b| {
            b.iter(|| {
                rt.coordinator().acquire_exclusive(&t);
                rt.coordinator().release_exclusive(&t);
            })
        });
    }

    group.bench_function("safepoint_round_trip", |b| {
        b.iter(|| {
            rt.coordinator().acquire_safepoint(&t);
            rt.coordinator().release_safepoint(&t);
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_access_token,
    bench_monitor_uncontended,
    bench_exclusive
);
criterion_main!(benches);
