//! Criterion benchmarks for the coordination core's hot paths.
//!
//! Run with:
//!   cargo bench
//!
//! Covers:
//!   - Rate limiter `try_consume` (the per-request token-bucket check)
//!   - Priority queue `enqueue`/`dequeue` (admission + dispatch)
//!   - DAG engine `executable_tasks` over a moderately sized dependency graph

use beadbroker::dag::{DagEngine, TaskNode};
use beadbroker::queue::{PriorityClass, PriorityQueue, QueueCaps};
use beadbroker::ratelimit::{BucketConfig, RateLimiterManager};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_rate_limiter(c: &mut Criterion) {
    let manager = RateLimiterManager::new(BucketConfig {
        capacity: 1_000_000.0,
        refill_rate: 1_000_000.0,
    });
    c.bench_function("rate_limiter_try_consume", |b| {
        b.iter(|| black_box(manager.try_consume("anthropic")));
    });
}

fn bench_priority_queue(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let queue = PriorityQueue::new(
        QueueCaps {
            high: 1_000_000,
            medium: 1_000_000,
            low: 1_000_000,
        },
        true,
        None,
    );
    c.bench_function("priority_queue_enqueue_dequeue", |b| {
        b.iter(|| {
            runtime.block_on(async {
                black_box(queue.enqueue("t1", PriorityClass::Medium).await);
            });
            black_box(queue.dequeue(PriorityClass::Medium));
        });
    });
}

fn bench_dag_executable_tasks(c: &mut Criterion) {
    let dag = DagEngine::new();
    for i in 0..500 {
        dag.add_task(TaskNode {
            id: format!("t{i}"),
            priority: (i % 10) as i64,
            created_at: i as i64,
            state: "READY".to_string(),
        });
        if i > 0 {
            dag.add_dependency(&format!("t{i}"), &format!("t{}", i - 1), beadbroker::store::model::DependencyKind::Soft)
                .unwrap();
        }
    }
    c.bench_function("dag_executable_tasks_500_nodes", |b| {
        b.iter(|| black_box(dag.executable_tasks()));
    });
}

criterion_group!(
    benches,
    bench_rate_limiter,
    bench_priority_queue,
    bench_dag_executable_tasks
);
criterion_main!(benches);
