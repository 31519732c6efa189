use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use dropqueue_jobs::{
    JobQueueManager, JobSpec, ManagerConfig, ManualClock, Priority, PromotionPolicy, QueueConfig,
};

const PRIORITIES: [Priority; 3] = [Priority::Low, Priority::Normal, Priority::High];

fn manager(concurrency: usize, promotion: PromotionPolicy) -> JobQueueManager {
    JobQueueManager::builder()
        .config(ManagerConfig {
            auto_start: false,
            promotion,
            ..Default::default()
        })
        .clock(ManualClock::starting_now())
        .queue(QueueConfig::new("imports", concurrency))
        .build()
        .unwrap()
}

fn fill(manager: &JobQueueManager, backlog: usize) {
    for i in 0..backlog {
        manager
            .submit(
                "imports",
                JobSpec::new("import").priority(PRIORITIES[i % PRIORITIES.len()]),
            )
            .unwrap();
    }
}

fn bench_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit");
    group.throughput(Throughput::Elements(1));

    let manager = manager(1, PromotionPolicy::OnePerTick);
    group.bench_function("submit_normal_priority", |b| {
        b.iter(|| {
            manager
                .submit("imports", black_box(JobSpec::new("import")))
                .unwrap()
        });
    });

    group.finish();
}

/// Select-and-promote cost as the queued backlog grows.
fn bench_tick_with_backlog(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick_with_backlog");

    for backlog in [10usize, 100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            b.iter_batched(
                || {
                    let m = manager(1, PromotionPolicy::OnePerTick);
                    fill(&m, backlog);
                    m
                },
                |m| black_box(m.tick()),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Full drain: promote and complete every job.
fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain");
    group.sample_size(20);

    for (label, promotion) in [
        ("one_per_tick", PromotionPolicy::OnePerTick),
        ("fill_available", PromotionPolicy::FillAvailable),
    ] {
        group.bench_with_input(BenchmarkId::new(label, 500), &promotion, |b, &promotion| {
            b.iter_batched(
                || {
                    let m = manager(8, promotion);
                    fill(&m, 500);
                    m
                },
                |m| loop {
                    let report = m.tick();
                    if report.promoted.is_empty() {
                        break;
                    }
                    for id in report.promoted {
                        m.complete_job(id, true).unwrap();
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_submit, bench_tick_with_backlog, bench_drain);
criterion_main!(benches);
