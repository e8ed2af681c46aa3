//! Benchmarks for pipeline push throughput.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use replicator_streams::prelude::*;
use replicator_streams::testing::{wait_until, Counter};
use std::time::Duration;

const BATCH: u64 = 10_000;

fn sync_push(c: &mut Criterion) {
    let pipeline = builder::<u64>()
        .from_push()
        .filter(|v| Ok(v % 7 != 0))
        .map(|v| v.to_string())
        .to(|v| Ok(!v.is_empty()))
        .build()
        .expect("valid pipeline");
    pipeline.start().expect("pipeline starts");

    let mut group = c.benchmark_group("sync_push");
    group.throughput(Throughput::Elements(BATCH));
    group.bench_function("filter_map_sink", |b| {
        b.iter(|| {
            for value in 0..BATCH {
                black_box(pipeline.push(value));
            }
        });
    });
    group.finish();

    pipeline.stop().expect("pipeline stops");
}

fn queued_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("queued_push");
    group.throughput(Throughput::Elements(BATCH));

    for tasks in [1usize, 4] {
        let delivered = Counter::new();
        let sink = delivered.clone();
        let pipeline = builder::<u64>()
            .tasks(tasks)
            .expect("positive tasks")
            .queue(QueueKind::Unbounded)
            .expect("valid queue")
            .partitioner(partition::modulo(|v: &u64| *v))
            .from_push()
            .to(move |_| {
                sink.increment();
                Ok(true)
            })
            .build()
            .expect("valid pipeline");
        pipeline.start().expect("pipeline starts");

        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, _| {
            b.iter(|| {
                let target = delivered.get() + usize::try_from(BATCH).unwrap_or(usize::MAX);
                for value in 0..BATCH {
                    pipeline.push(value);
                }
                wait_until(Duration::from_secs(30), || delivered.get() >= target)
            });
        });

        pipeline.stop().expect("pipeline stops");
    }
    group.finish();
}

criterion_group!(benches, sync_push, queued_push);
criterion_main!(benches);
