//! Replayable scan sources driven by the engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use arrow::array::{Int64Array, RecordBatch, RecordBatchIterator};
use arrow::datatypes::{DataType as ArrowType, Field as ArrowField, Schema, SchemaRef};
use colbridge::schema_bridge::to_arrow_schema;
use colbridge::{
    BatchReader, BridgeConfig, BridgeError, DataType, Expr, Field, Frame, JoinType, Plan,
    ScanSource, SchemaDescriptor,
};

fn key_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![ArrowField::new("k", ArrowType::Int64, true)]))
}

fn key_batch(keys: &[i64]) -> RecordBatch {
    RecordBatch::try_new(key_schema(), vec![Arc::new(Int64Array::from(keys.to_vec()))]).unwrap()
}

/// Source over `[{k:0},{k:1},{k:2},{k:0}]` in two batches, counting pulls.
fn counting_source(pulls: Arc<AtomicUsize>) -> ScanSource {
    ScanSource::new(move || {
        let pulls = Arc::clone(&pulls);
        let batches = vec![key_batch(&[0, 1]), key_batch(&[2, 0])]
            .into_iter()
            .map(move |b| {
                pulls.fetch_add(1, Ordering::SeqCst);
                Ok(b)
            });
        Ok(Box::new(RecordBatchIterator::new(batches, key_schema())) as BatchReader)
    })
}

fn self_join(plan: Plan) -> Plan {
    let right = plan.try_clone().unwrap();
    plan.join(
        right,
        vec![Expr::col("k").unwrap()],
        vec![Expr::col("k").unwrap()],
        JoinType::Inner,
    )
    .unwrap()
}

#[test]
fn test_self_join_replays_the_factory() {
    let pulls = Arc::new(AtomicUsize::new(0));
    let source = counting_source(Arc::clone(&pulls)).with_arrow_schema(key_schema());
    let stats = source.stats();

    let frame = self_join(Plan::scan(source).unwrap()).collect().unwrap();

    // 2*2 + 1*1 + 1*1
    assert_eq!(frame.height().unwrap(), 6);
    assert_eq!(stats.factory_calls(), 2);
    assert_eq!(stats.passes(), 2);
    assert_eq!(stats.readers_closed(), 2);
    assert_eq!(pulls.load(Ordering::SeqCst), 4);

    // Same answer as joining two materialized copies.
    let materialized = || {
        Plan::from_frame(Frame::from_batches(key_schema(), vec![key_batch(&[0, 1, 2, 0])]).unwrap())
            .unwrap()
    };
    let expected = materialized()
        .join(
            materialized(),
            vec![Expr::col("k").unwrap()],
            vec![Expr::col("k").unwrap()],
            JoinType::Inner,
        )
        .unwrap()
        .collect()
        .unwrap();
    assert_eq!(expected.height().unwrap(), 6);
}

#[test]
fn test_probe_opens_but_never_pulls() {
    let pulls = Arc::new(AtomicUsize::new(0));
    let source = counting_source(Arc::clone(&pulls));
    let stats = source.stats();

    let plan = Plan::scan(source).unwrap();
    assert_eq!(stats.factory_calls(), 1);
    assert_eq!(pulls.load(Ordering::SeqCst), 0);
    assert_eq!(
        plan.schema().unwrap(),
        SchemaDescriptor::new(vec![Field::new("k", DataType::Int64, true)])
    );

    assert_eq!(plan.collect().unwrap().height().unwrap(), 4);
    assert_eq!(stats.factory_calls(), 2);
    assert_eq!(pulls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_probe_disabled_needs_explicit_schema() {
    let config = BridgeConfig {
        probe_schema: false,
        ..BridgeConfig::default()
    };
    let err = Plan::scan_with(counting_source(Arc::default()), &config).unwrap_err();
    assert!(matches!(err, BridgeError::Schema(_)), "{err}");

    let desc = SchemaDescriptor::new(vec![Field::new("k", DataType::Int64, true)]);
    let source = counting_source(Arc::default()).with_schema(&desc).unwrap();
    assert!(Plan::scan_with(source, &config).is_ok());
}

#[test]
fn test_single_use_source_cannot_replay() {
    let reader = RecordBatchIterator::new(vec![Ok(key_batch(&[0, 1, 2, 0]))], key_schema());
    let source = ScanSource::once(Box::new(reader));
    let stats = source.stats();

    let err = self_join(Plan::scan(source).unwrap()).collect().unwrap_err();
    assert!(
        matches!(err, BridgeError::Source(ref m) if m.contains("already consumed")),
        "{err}"
    );
    // Schema came from the reader, not from a probe.
    assert_eq!(stats.factory_calls(), 2);
}

#[test]
fn test_zero_row_typed_source() {
    let desc = SchemaDescriptor::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
    ]);
    let schema = to_arrow_schema(&desc).unwrap();
    let source = ScanSource::from_iter_factory(schema, Vec::new);

    let frame = Plan::scan(source).unwrap().collect().unwrap();
    assert_eq!(frame.height().unwrap(), 0);
    assert_eq!(frame.schema().unwrap().to_descriptor().unwrap(), desc);
}

#[test]
fn test_factory_error_aborts_query() {
    let source = ScanSource::new(|| Err(BridgeError::Source("connection refused".into())))
        .with_arrow_schema(key_schema());
    let err = Plan::scan(source).unwrap().collect().unwrap_err();
    assert!(
        matches!(err, BridgeError::Source(ref m) if m == "connection refused"),
        "{err}"
    );
}

#[test]
fn test_mid_scan_fault_is_not_truncation() {
    let source = ScanSource::from_iter_factory(key_schema(), || {
        vec![
            Ok(key_batch(&[1])),
            Err(BridgeError::Source("disk went away".into())),
            Ok(key_batch(&[2])),
        ]
    });
    let stats = source.stats();
    let err = Plan::scan(source).unwrap().collect().unwrap_err();
    assert!(matches!(err, BridgeError::Source(ref m) if m == "disk went away"), "{err}");
    assert_eq!(stats.readers_closed(), 1);
}

#[test]
fn test_factory_panic_is_contained() {
    let source = ScanSource::new(|| panic!("factory exploded")).with_arrow_schema(key_schema());
    let err = Plan::scan(source).unwrap().collect().unwrap_err();
    assert!(
        matches!(err, BridgeError::Source(ref m) if m.contains("factory exploded")),
        "{err}"
    );
}

#[test]
fn test_renamed_column_is_a_schema_mismatch() {
    let renamed = Arc::new(Schema::new(vec![ArrowField::new("key", ArrowType::Int64, true)]));
    let source = ScanSource::from_iter_factory(key_schema(), move || {
        vec![
            Ok(key_batch(&[1])),
            Ok(RecordBatch::try_new(renamed.clone(), vec![Arc::new(Int64Array::from(vec![2]))])
                .unwrap()),
        ]
    });
    let err = Plan::scan(source).unwrap().collect().unwrap_err();
    assert!(matches!(err, BridgeError::SchemaMismatch(_)), "{err}");
}

#[test]
fn test_factory_runs_on_engine_thread() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let names = Arc::clone(&seen);
    let source = ScanSource::new(move || {
        names
            .lock()
            .unwrap()
            .push(std::thread::current().name().map(str::to_string));
        Ok(Box::new(RecordBatchIterator::new(vec![Ok(key_batch(&[1]))], key_schema()))
            as BatchReader)
    })
    .with_arrow_schema(key_schema());

    Plan::scan(source).unwrap().collect().unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![Some(colbridge_native::ENGINE_THREAD_NAME.to_string())]
    );
}

#[test]
fn test_release_once_after_last_plan() {
    let source = ScanSource::from_batches(key_schema(), vec![key_batch(&[1, 2])]);
    let stats = source.stats();
    let plan = Plan::scan(source).unwrap();
    let copy = plan.try_clone().unwrap();

    drop(plan);
    assert_eq!(stats.releases(), 0);
    assert_eq!(copy.collect().unwrap().height().unwrap(), 2);
    assert_eq!(stats.releases(), 1);
}

#[test]
fn test_concat_opens_one_pass_per_input() {
    let source = ScanSource::from_batches(key_schema(), vec![key_batch(&[1, 2, 3])]);
    let stats = source.stats();
    let plan = Plan::scan(source).unwrap();
    let copy = plan.try_clone().unwrap();
    let frame = Plan::concat(vec![plan, copy]).unwrap().collect().unwrap();
    assert_eq!(frame.height().unwrap(), 6);
    assert_eq!(stats.passes(), 2);
}

#[test]
fn test_rejected_reader_is_still_closed() {
    let renamed = Arc::new(Schema::new(vec![ArrowField::new("key", ArrowType::Int64, true)]));
    let source = ScanSource::new(move || {
        let batch =
            RecordBatch::try_new(renamed.clone(), vec![Arc::new(Int64Array::from(vec![1]))])
                .unwrap();
        Ok(Box::new(RecordBatchIterator::new(vec![Ok(batch)], renamed.clone())) as BatchReader)
    })
    .with_arrow_schema(key_schema());
    let stats = source.stats();
    let err = Plan::scan(source).unwrap().collect().unwrap_err();
    assert!(matches!(err, BridgeError::SchemaMismatch(_)), "{err}");
    assert_eq!(stats.factory_calls(), 1);
    assert_eq!(stats.readers_closed(), 1);
}

/// Source whose first `failing` factory calls fail with `call <n> refused`.
fn refusing_source(failing: usize) -> ScanSource {
    let calls = AtomicUsize::new(0);
    ScanSource::new(move || {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        if call < failing {
            return Err(BridgeError::Source(format!("call {call} refused")));
        }
        Ok(Box::new(RecordBatchIterator::new(vec![Ok(key_batch(&[1, 2]))], key_schema()))
            as BatchReader)
    })
    .with_arrow_schema(key_schema())
}

/// Collect `plan` and a clone of it on two threads started together.
fn collect_side_by_side(plan: Plan) -> Vec<colbridge::Result<usize>> {
    let copy = plan.try_clone().unwrap();
    let start = Barrier::new(2);
    thread::scope(|s| {
        let runs: Vec<_> = [plan, copy]
            .into_iter()
            .map(|p| {
                let start = &start;
                s.spawn(move || {
                    start.wait();
                    p.collect().and_then(|frame| frame.height())
                })
            })
            .collect();
        runs.into_iter().map(|r| r.join().unwrap()).collect()
    })
}

#[test]
fn test_concurrent_clones_keep_their_own_faults() {
    let results = collect_side_by_side(Plan::scan(refusing_source(1)).unwrap());
    let (ok, failed): (Vec<_>, Vec<_>) = results.into_iter().partition(|r| r.is_ok());
    assert_eq!(ok.len(), 1);
    assert_eq!(*ok[0].as_ref().unwrap(), 2);
    assert_eq!(failed.len(), 1);
    let err = failed[0].as_ref().unwrap_err();
    assert!(matches!(err, BridgeError::Source(m) if m == "call 0 refused"), "{err}");
}

#[test]
fn test_concurrent_failures_are_not_crossed() {
    let results = collect_side_by_side(Plan::scan(refusing_source(2)).unwrap());
    let mut messages: Vec<_> = results
        .into_iter()
        .map(|r| match r {
            Err(BridgeError::Source(m)) => m,
            other => panic!("expected a source error, got {other:?}"),
        })
        .collect();
    messages.sort();
    assert_eq!(messages, vec!["call 0 refused", "call 1 refused"]);
}
