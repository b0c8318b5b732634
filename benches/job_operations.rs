mod common;

use common::{bench_envelopes, create_bench_database};
use courier::{JobPayload, JobSpec, SendOutgoing};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

fn send_payload(i: u64) -> JobPayload {
    JobPayload::SendOutgoing(SendOutgoing {
        message_id: format!("m-{i}"),
        conversation_id: format!("conv-{}", i % 8),
        recipient: format!("recipient-{}", i % 8),
        body: format!("benchmark_payload_{i}"),
        attachments: vec![],
    })
}

fn bench_add_job(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let db = rt.block_on(create_bench_database());

    c.bench_function("add_job", |b| {
        b.to_async(&rt).iter_custom(|iters| {
            let db = db.clone();
            async move {
                let utils = db.worker_utils();
                let start = std::time::Instant::now();
                for i in 0..iters {
                    utils
                        .add_job(send_payload(i), JobSpec::default())
                        .await
                        .expect("Failed to add job");
                }
                let elapsed = start.elapsed();
                db.clear_jobs().await;
                elapsed
            }
        });
    });

    rt.block_on(db.drop());
}

fn bench_enqueue_envelopes(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let db = rt.block_on(create_bench_database());

    let mut group = c.benchmark_group("enqueue_envelopes");
    for batch_size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &size| {
                b.to_async(&rt).iter_custom(|iters| {
                    let db = db.clone();
                    async move {
                        let utils = db.worker_utils();
                        let batches: Vec<_> =
                            (0..iters).map(|round| bench_envelopes(round, size)).collect();

                        let start = std::time::Instant::now();
                        for envelopes in &batches {
                            utils
                                .enqueue_envelopes(envelopes)
                                .await
                                .expect("Failed to enqueue envelopes");
                        }
                        let elapsed = start.elapsed();
                        db.clear_jobs().await;
                        elapsed
                    }
                });
            },
        );
    }
    group.finish();

    rt.block_on(db.drop());
}

fn bench_process_batch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let db = rt.block_on(create_bench_database());

    let mut group = c.benchmark_group("process_batch");
    group.sample_size(20);
    for batch_size in [10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &size| {
                b.to_async(&rt).iter_custom(|iters| {
                    let db = db.clone();
                    async move {
                        let processor = db.batch_processor();
                        let batches: Vec<_> =
                            (0..iters).map(|round| bench_envelopes(round, size)).collect();

                        let start = std::time::Instant::now();
                        for envelopes in &batches {
                            processor
                                .process_batch(envelopes)
                                .await
                                .expect("Failed to process batch");
                        }
                        let elapsed = start.elapsed();
                        assert_eq!(db.job_count().await, (iters as usize * size) as i64);
                        db.clear_jobs().await;
                        elapsed
                    }
                });
            },
        );
    }
    group.finish();

    rt.block_on(db.drop());
}

criterion_group!(
    benches,
    bench_add_job,
    bench_enqueue_envelopes,
    bench_process_batch,
);
criterion_main!(benches);
