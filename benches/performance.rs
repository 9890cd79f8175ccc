use std::sync::Arc;
use std::thread;

use arrow::array::{Int64Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use colbridge::{BoundedBatchQueue, BridgeError, Frame, Plan, ScanSource, SinkOptions};
use criterion::{criterion_group, criterion_main, Criterion};

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]))
}

fn make_batches(batches: usize, rows: usize) -> Vec<RecordBatch> {
    (0..batches)
        .map(|b| {
            let base = (b * rows) as i64;
            RecordBatch::try_new(
                schema(),
                vec![
                    Arc::new(Int64Array::from_iter_values((0..rows as i64).map(|i| (base + i) % 64))),
                    Arc::new(Int64Array::from_iter_values((0..rows as i64).map(|i| base + i))),
                ],
            )
            .unwrap()
        })
        .collect()
}

fn bench_queue_handoff(c: &mut Criterion) {
    c.bench_function("queue_handoff_1k", |b| {
        b.iter(|| {
            let queue = BoundedBatchQueue::with_capacity(8);
            thread::scope(|s| {
                s.spawn(|| {
                    for i in 0..1_000usize {
                        queue.put(i).unwrap();
                    }
                    queue.complete();
                });
                let mut n = 0;
                while let Some(_) = queue.take().unwrap() {
                    n += 1;
                }
                assert_eq!(n, 1_000);
            });
        })
    });
}

fn bench_sinks(c: &mut Criterion) {
    let batches = make_batches(64, 1024);
    let plan = || Plan::from_frame(Frame::from_batches(schema(), batches.clone()).unwrap()).unwrap();

    c.bench_function("direct_sink_64x1024", |b| {
        b.iter(|| {
            let mut rows = 0;
            plan()
                .sink(|batch| {
                    rows += batch.num_rows();
                    Ok::<(), BridgeError>(())
                })
                .unwrap();
            assert_eq!(rows, 64 * 1024);
        })
    });

    c.bench_function("pull_sink_64x1024", |b| {
        b.iter(|| {
            let rows = plan()
                .sink_to(SinkOptions::default(), |cursor| {
                    let mut rows = 0;
                    for batch in cursor {
                        rows += batch?.num_rows();
                    }
                    Ok::<_, BridgeError>(rows)
                })
                .unwrap();
            assert_eq!(rows, 64 * 1024);
        })
    });
}

fn bench_scan_self_join(c: &mut Criterion) {
    let batches = make_batches(16, 256);
    c.bench_function("scan_self_join_16x256", |b| {
        b.iter(|| {
            let left = Plan::scan(ScanSource::from_batches(schema(), batches.clone())).unwrap();
            let right = left.try_clone().unwrap();
            let joined = left
                .join(
                    right,
                    vec![colbridge::Expr::col("k").unwrap()],
                    vec![colbridge::Expr::col("k").unwrap()],
                    colbridge::JoinType::Inner,
                )
                .unwrap();
            let _ = joined.collect().unwrap().height().unwrap();
        })
    });
}

criterion_group!(bridge, bench_queue_handoff, bench_sinks, bench_scan_self_join);
criterion_main!(bridge);
