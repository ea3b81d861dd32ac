//! Coalescing window throughput

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use vigil_watcher::coalesce::{Coalescer, Resolver};
use vigil_watcher::debounce::Window;
use vigil_watcher::normalize::{Change, Observation};
use vigil_watcher::{FileState, WatchTargetId};

/// Every path is unknown before and gone after
struct NullResolver;

impl Resolver for NullResolver {
    fn known(&self, _path: &Path) -> Option<FileState> {
        None
    }

    fn current(&self, _path: &Path) -> Option<FileState> {
        None
    }
}

fn observations(count: usize, paths: usize) -> Vec<Observation> {
    let changes = [Change::Create, Change::Modify, Change::Modify, Change::Delete];
    (0..count)
        .map(|n| Observation {
            target: WatchTargetId::new(1),
            path: PathBuf::from(format!("/bench/dir{}/file{}", n % 16, n % paths)),
            change: changes[(n / paths) % changes.len()],
            cookie: None,
            observed_at: SystemTime::now(),
        })
        .collect()
}

fn bench_push_and_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("coalesce");

    for paths in [100usize, 1_000] {
        let batch = observations(10_000, paths);
        group.throughput(Throughput::Elements(batch.len() as u64));
        group.bench_with_input(BenchmarkId::new("push_flush", paths), &batch, |b, batch| {
            b.iter(|| {
                let coalescer = Coalescer::new(Window::new(Duration::from_millis(300), Duration::from_secs(5)));
                let now = Instant::now();
                for obs in batch {
                    coalescer.push(obs.clone(), now);
                }
                black_box(coalescer.flush(&NullResolver))
            });
        });
    }

    group.finish();
}

fn bench_collect_ready(c: &mut Criterion) {
    let batch = observations(10_000, 1_000);
    c.bench_function("coalesce/collect_ready_1k_paths", |b| {
        b.iter(|| {
            let coalescer = Coalescer::new(Window::new(Duration::from_millis(300), Duration::from_secs(5)));
            let start = Instant::now();
            for obs in &batch {
                coalescer.push(obs.clone(), start);
            }
            black_box(coalescer.collect_ready(start + Duration::from_secs(1), &NullResolver))
        });
    });
}

criterion_group!(benches, bench_push_and_flush, bench_collect_ready);
criterion_main!(benches);
