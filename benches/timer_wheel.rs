//! Benchmarks for the timer wheel and registry hot paths.
//!
//! Run with: cargo bench --bench timer_wheel

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use meshpeer::{HostInfo, HostMap, TimerWheel};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(100);
const SPAN: Duration = Duration::from_secs(2);

/// Wheel with `n` entries spread over the whole span.
fn populated_wheel(n: u32) -> TimerWheel<u32> {
    let mut wheel = TimerWheel::new(TICK, SPAN);
    for k in 0..n {
        wheel.add(k, TICK * (k % 20 + 1));
    }
    wheel
}

// ===== TimerWheel Benchmarks =====

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("wheel_add");

    for &count in &[1_000u32, 10_000, 50_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let mut wheel = TimerWheel::new(TICK, SPAN);
                for k in 0..count {
                    wheel.add(black_box(k), TICK * 3);
                }
                wheel
            })
        });
    }

    group.finish();
}

fn bench_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("wheel_advance_full_span");

    for &count in &[1_000u32, 10_000, 50_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let mut wheel = populated_wheel(count);
                let start = Instant::now();
                wheel.advance(start);
                black_box(wheel.advance(start + SPAN).len())
            })
        });
    }

    group.finish();
}

fn bench_rearm_cycle(c: &mut Criterion) {
    // One tick of a busy relay: everything due fires and is re-armed
    c.bench_function("wheel_rearm_10000", |b| {
        let mut wheel = TimerWheel::new(TICK, SPAN);
        for k in 0..10_000u32 {
            wheel.add(k, TICK);
        }
        let mut now = Instant::now();
        wheel.advance(now);
        b.iter(|| {
            now += TICK;
            for key in wheel.advance(now) {
                wheel.add(key, TICK);
            }
        })
    });
}

// ===== HostMap Benchmarks =====

fn bench_hostmap_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("hostmap_lookup");

    for &count in &[100u32, 10_000] {
        let map = HostMap::new("bench", None, Vec::new());
        for i in 1..=count {
            let info = Arc::new(HostInfo::new(Ipv4Addr::from(0x0a00_0000 + i)));
            info.set_local_index(i);
            info.set_remote_index(i + count);
            map.insert_full(&info);
        }
        let target = Ipv4Addr::from(0x0a00_0000 + count / 2);

        group.bench_with_input(BenchmarkId::new("by_ip", count), &count, |b, _| {
            b.iter(|| map.get_by_ip(black_box(target)).is_ok())
        });
        group.bench_with_input(BenchmarkId::new("by_index", count), &count, |b, _| {
            b.iter(|| map.get_by_local_index(black_box(count / 2)).is_ok())
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_add,
    bench_advance,
    bench_rearm_cycle,
    bench_hostmap_lookup,
);

criterion_main!(benches);
