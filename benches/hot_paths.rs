use criterion::{black_box, criterion_group, criterion_main, Criterion};

use traceflow::clock;
use traceflow::dyntrace::{accept, TraceStage};
use traceflow::flow::{daily_quota, within_quota_limit, CallerClass};

fn bench_accept(c: &mut Criterion) {
    c.bench_function("accept_start_to_dump", |b| {
        b.iter(|| {
            accept(
                black_box(TraceStage::Start),
                black_box(TraceStage::Dump),
                black_box(555),
                black_box(555),
            )
        })
    });

    c.bench_function("accept_rejected_transition", |b| {
        b.iter(|| {
            accept(
                black_box(TraceStage::Stop),
                black_box(TraceStage::Dump),
                black_box(0),
                black_box(555),
            )
        })
    });
}

fn bench_quota_math(c: &mut Criterion) {
    let limit = daily_quota(CallerClass::Xperf, false).expect("limit");

    c.bench_function("within_quota_limit_under", |b| {
        b.iter(|| within_quota_limit(black_box(limit / 2), black_box(1024), black_box(limit)))
    });

    c.bench_function("within_quota_limit_tolerance", |b| {
        b.iter(|| {
            within_quota_limit(
                black_box(limit),
                black_box(limit / 20),
                black_box(limit),
            )
        })
    });
}

fn bench_day_formatting(c: &mut Criterion) {
    // 2024-06-14 10:00:00 UTC
    let t = 1_718_359_200_000i64;

    c.bench_function("day_string", |b| b.iter(|| clock::day_string(black_box(t))));
    c.bench_function("day_compact", |b| b.iter(|| clock::day_compact(black_box(t))));
}

criterion_group!(benches, bench_accept, bench_quota_math, bench_day_formatting);
criterion_main!(benches);
