//! Executing plans into host code.
//!
//! There is one push primitive, [`push_batches`], which runs a plan through
//! the engine's sink entry point and calls back once per output batch on the
//! engine thread. [`Plan::sink`] exposes it directly. [`Plan::sink_to`] wraps
//! it: the callback feeds a [`BoundedBatchQueue`] and a consumer running on
//! its own host thread pulls through a [`PullCursor`]. A full queue blocks
//! the engine thread, so a slow consumer throttles execution.

use std::any::Any;
use std::collections::BTreeMap;
use std::ffi::{c_int, c_void};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use arrow::array::{ArrayRef, RecordBatch, RecordBatchOptions};
use arrow::compute::{can_cast_types, cast};
use arrow::datatypes::{DataType as ArrowType, Schema, SchemaRef};
use arrow::ffi::{FFI_ArrowArray, FFI_ArrowSchema};
use colbridge_core::config::BridgeConfig;
use colbridge_core::Error as CoreError;
use colbridge_native::plan;

use crate::error::{native_status, BridgeError, Result};
use crate::metrics;
use crate::queue::BoundedBatchQueue;
use crate::resources::{Frame, Plan};
use crate::schema_bridge;
use crate::source;

struct PushState<F, E> {
    on_batch: F,
    schema: SchemaRef,
    delivered: usize,
    error: Option<E>,
    panic: Option<Box<dyn Any + Send>>,
}

/// Move a pushed batch out of the engine's structs.
///
/// # Safety
/// Both pointers must be null or valid structs the callee may take.
unsafe fn take_batch(array: *mut FFI_ArrowArray, schema: *mut FFI_ArrowSchema) -> Result<RecordBatch> {
    if array.is_null() || schema.is_null() {
        return Err(BridgeError::Native("null batch pointer in push callback".into()));
    }
    // SAFETY: the engine hands both structs over; empty ones stay behind.
    let (array, schema) = unsafe {
        (
            std::ptr::replace(array, FFI_ArrowArray::empty()),
            std::ptr::replace(schema, FFI_ArrowSchema::empty()),
        )
    };
    unsafe { schema_bridge::import_batch(array, &schema) }
}

unsafe extern "C" fn push_trampoline<F, E>(
    user_data: *mut c_void,
    array: *mut FFI_ArrowArray,
    schema: *mut FFI_ArrowSchema,
) -> c_int
where
    F: FnMut(RecordBatch) -> std::result::Result<(), E>,
    E: From<BridgeError>,
{
    // SAFETY: `user_data` is the `PushState` owned by `push_batches`, which
    // outlives the sink call; the engine calls back from one thread at a time.
    let state = unsafe { &mut *(user_data as *mut PushState<F, E>) };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let batch = unsafe { take_batch(array, schema) }.map_err(E::from)?;
        schema_bridge::ensure_same_layout(&state.schema, batch.schema_ref()).map_err(E::from)?;
        let batch = schema_bridge::rebind(&batch, &state.schema).map_err(E::from)?;
        metrics::global().record_push();
        (state.on_batch)(batch)
    }));
    match outcome {
        Ok(Ok(())) => {
            state.delivered += 1;
            0
        }
        Ok(Err(e)) => {
            state.error = Some(e);
            1
        }
        Err(payload) => {
            state.panic = Some(payload);
            1
        }
    }
}

/// Run `plan`, calling `on_batch` inline on the engine thread for every
/// non-empty output batch. Returns the number of batches delivered.
///
/// An error from `on_batch` stops the engine and is returned as is; a panic
/// in it is resumed on the calling thread after the engine has stopped.
pub(crate) fn push_batches<F, E>(plan: Plan, on_batch: F) -> std::result::Result<usize, E>
where
    F: FnMut(RecordBatch) -> std::result::Result<(), E> + Send,
    E: From<BridgeError> + Send,
{
    let schema = plan.arrow_schema().map_err(E::from)?;
    let (ptr, sources) = plan.into_parts().map_err(E::from)?;
    let mut state = PushState {
        on_batch,
        schema,
        delivered: 0,
        error: None,
        panic: None,
    };
    let user_data = &mut state as *mut PushState<F, E> as *mut c_void;
    let status = native_status(|| unsafe {
        plan::cb_plan_sink_batches(ptr, Some(push_trampoline::<F, E>), user_data)
    });
    if let Some(payload) = state.panic.take() {
        resume_unwind(payload);
    }
    if let Some(e) = state.error.take() {
        return Err(e);
    }
    match status {
        Ok(()) => Ok(state.delivered),
        Err(e) => Err(E::from(source::claim_fault(&sources, &e).unwrap_or(e))),
    }
}

#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Queue capacity in batches.
    pub buffer_size: usize,
    /// Columns cast to another type before they reach the consumer.
    pub type_overrides: BTreeMap<String, ArrowType>,
    pub consumer_thread_name: String,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

impl SinkOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            buffer_size: config.sink_buffer_size,
            type_overrides: BTreeMap::new(),
            consumer_thread_name: config.consumer_thread_name.clone(),
        }
    }

    pub fn with_buffer_size(mut self, n: usize) -> Self {
        self.buffer_size = n;
        self
    }

    pub fn with_override(mut self, column: impl Into<String>, dt: ArrowType) -> Self {
        self.type_overrides.insert(column.into(), dt);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(CoreError::Config("sink buffer_size must be > 0".into()).into());
        }
        Ok(())
    }
}

/// Output schema and per-column cast targets for `overrides`.
fn resolve_overrides(
    schema: &Schema,
    overrides: &BTreeMap<String, ArrowType>,
) -> Result<(SchemaRef, Vec<Option<ArrowType>>)> {
    let mut casts = vec![None; schema.fields().len()];
    let mut fields: Vec<_> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    for (name, to) in overrides {
        let idx = schema
            .index_of(name)
            .map_err(|_| BridgeError::Schema(format!("type override names unknown column '{name}'")))?;
        let from = fields[idx].data_type();
        if !can_cast_types(from, to) {
            return Err(BridgeError::Schema(format!(
                "column '{name}' cannot be cast from {from} to {to}"
            )));
        }
        fields[idx] = fields[idx].clone().with_data_type(to.clone());
        casts[idx] = Some(to.clone());
    }
    Ok((Arc::new(Schema::new(fields)), casts))
}

fn apply_casts(
    batch: RecordBatch,
    schema: &SchemaRef,
    casts: &[Option<ArrowType>],
) -> Result<RecordBatch> {
    if casts.iter().all(Option::is_none) {
        return Ok(batch);
    }
    let columns = batch
        .columns()
        .iter()
        .zip(casts)
        .map(|(col, to)| match to {
            Some(to) => cast(col, to),
            None => Ok(col.clone()),
        })
        .collect::<std::result::Result<Vec<ArrayRef>, _>>()?;
    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        schema.clone(),
        columns,
        &options,
    )?)
}

/// Forward-only view of a pull-adapted sink, handed to the consumer.
///
/// Dropping the cursor (or calling [`close`](PullCursor::close)) tells the
/// engine to stop.
pub struct PullCursor<'q> {
    queue: &'q BoundedBatchQueue<RecordBatch>,
    schema: SchemaRef,
    received: usize,
    done: bool,
}

impl PullCursor<'_> {
    /// Schema of the batches this cursor yields, overrides applied.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn received(&self) -> usize {
        self.received
    }

    /// Batches currently buffered and not yet pulled.
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn high_water_mark(&self) -> usize {
        self.queue.high_water_mark()
    }

    pub fn close(&mut self) {
        self.done = true;
        self.queue.close();
    }
}

impl Iterator for PullCursor<'_> {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.queue.take() {
            Ok(Some(batch)) => {
                self.received += 1;
                Some(Ok(batch))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for PullCursor<'_> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Fails the queue if the producer side unwinds before finishing it.
struct FinishGuard<'q>(&'q BoundedBatchQueue<RecordBatch>);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.0
            .fail(BridgeError::Source("producer stopped without finishing".into()));
    }
}

impl Plan {
    /// Direct sink: `on_batch` runs inline on the engine thread.
    pub fn sink<F, E>(self, on_batch: F) -> std::result::Result<usize, E>
    where
        F: FnMut(RecordBatch) -> std::result::Result<(), E> + Send,
        E: From<BridgeError> + Send,
    {
        push_batches(self, on_batch)
    }

    /// Pull-adapted sink. `consumer` runs on its own thread and drains a
    /// bounded queue the engine fills; its result is returned once both
    /// sides have stopped. A consumer error is returned unchanged; returning
    /// early without error simply stops the engine.
    pub fn sink_to<T, E, C>(self, options: SinkOptions, consumer: C) -> std::result::Result<T, E>
    where
        C: FnOnce(&mut PullCursor<'_>) -> std::result::Result<T, E> + Send,
        T: Send,
        E: From<BridgeError> + Send,
    {
        options.validate().map_err(E::from)?;
        let plan_schema = self.arrow_schema().map_err(E::from)?;
        let (out_schema, casts) =
            resolve_overrides(&plan_schema, &options.type_overrides).map_err(E::from)?;
        let queue = BoundedBatchQueue::with_capacity(options.buffer_size);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            buffer = options.buffer_size,
            overrides = options.type_overrides.len(),
            "starting pull sink"
        );

        thread::scope(|scope| {
            let queue = &queue;
            let cursor_schema = out_schema.clone();
            let consumer_thread = thread::Builder::new()
                .name(options.consumer_thread_name.clone())
                .spawn_scoped(scope, move || {
                    let mut cursor = PullCursor {
                        queue,
                        schema: cursor_schema,
                        received: 0,
                        done: false,
                    };
                    catch_unwind(AssertUnwindSafe(|| consumer(&mut cursor)))
                })
                .map_err(|e| {
                    E::from(BridgeError::Consumer(format!(
                        "failed to start consumer thread: {e}"
                    )))
                })?;

            let guard = FinishGuard(queue);
            let produced = push_batches(self, |batch| -> Result<()> {
                queue.put(apply_casts(batch, &out_schema, &casts)?)
            });
            match &produced {
                Ok(_) => queue.complete(),
                Err(e) => queue.fail(e.clone()),
            }
            drop(guard);

            let consumed = consumer_thread
                .join()
                .unwrap_or_else(Err);
            metrics::emit_span(
                "sink_to",
                &[
                    ("delivered", produced.as_ref().map_or(0, |n| *n).to_string()),
                    ("high_water", queue.high_water_mark().to_string()),
                ],
            );
            match consumed {
                Err(payload) => resume_unwind(payload),
                Ok(Err(e)) => Err(e),
                Ok(Ok(value)) => match produced {
                    Ok(_) | Err(BridgeError::ConsumerClosed) => Ok(value),
                    Err(e) => Err(E::from(e)),
                },
            }
        })
    }
}

impl Frame {
    /// Hand every batch of the frame to `on_batch`, in order, on the
    /// calling thread.
    pub fn export_batches<F, E>(&self, mut on_batch: F) -> std::result::Result<usize, E>
    where
        F: FnMut(RecordBatch) -> std::result::Result<(), E>,
        E: From<BridgeError>,
    {
        let n = self.num_batches().map_err(E::from)?;
        for idx in 0..n {
            on_batch(self.export_batch(idx).map_err(E::from)?)?;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int32Array, Int64Array};
    use arrow::datatypes::Field;

    fn frame_plan(batches: usize) -> Plan {
        let schema = Arc::new(Schema::new(vec![Field::new("k", ArrowType::Int32, true)]));
        let data = (0..batches)
            .map(|i| {
                RecordBatch::try_new(
                    schema.clone(),
                    vec![Arc::new(Int32Array::from(vec![i as i32; 2]))],
                )
                .unwrap()
            })
            .collect();
        Plan::from_frame(Frame::from_batches(schema, data).unwrap()).unwrap()
    }

    #[test]
    fn test_direct_sink_runs_on_engine_thread() {
        let mut names = Vec::new();
        let n = frame_plan(3)
            .sink(|_batch| {
                names.push(thread::current().name().map(str::to_string));
                Ok::<(), BridgeError>(())
            })
            .unwrap();
        assert_eq!(n, 3);
        assert!(names
            .iter()
            .all(|n| n.as_deref() == Some(colbridge_native::ENGINE_THREAD_NAME)));
    }

    #[test]
    fn test_pull_sink_applies_overrides() {
        let options = SinkOptions::default().with_override("k", ArrowType::Int64);
        let rows = frame_plan(4)
            .sink_to(options, |cursor| {
                assert_eq!(cursor.schema().field(0).data_type(), &ArrowType::Int64);
                let mut rows = 0;
                for batch in cursor {
                    let batch = batch?;
                    assert!(batch.column(0).as_any().is::<Int64Array>());
                    rows += batch.num_rows();
                }
                Ok::<_, BridgeError>(rows)
            })
            .unwrap();
        assert_eq!(rows, 8);
    }

    #[test]
    fn test_unknown_override_fails_before_execution() {
        let options = SinkOptions::default().with_override("nope", ArrowType::Int64);
        let err = frame_plan(1)
            .sink_to(options, |_cursor| Ok::<_, BridgeError>(()))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Schema(ref m) if m.contains("nope")));
    }

    #[test]
    fn test_early_return_stops_engine() {
        let options = SinkOptions::default().with_buffer_size(1);
        let first = frame_plan(50)
            .sink_to(options, |cursor| {
                let batch = cursor.next().transpose()?;
                Ok::<_, BridgeError>(batch.map(|b| b.num_rows()))
            })
            .unwrap();
        assert_eq!(first, Some(2));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let err = frame_plan(1)
            .sink_to(SinkOptions::default().with_buffer_size(0), |_c| {
                Ok::<_, BridgeError>(())
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::Core(CoreError::Config(_))));
    }

    #[test]
    fn test_export_batches_in_order() {
        let frame = Frame::from_batch(
            &RecordBatch::try_new(
                Arc::new(Schema::new(vec![Field::new("k", ArrowType::Int32, true)])),
                vec![Arc::new(Int32Array::from(vec![1, 2, 3]))],
            )
            .unwrap(),
        )
        .unwrap();
        let mut seen = 0;
        let n = frame
            .export_batches(|b| {
                seen += b.column(0).len();
                Ok::<(), BridgeError>(())
            })
            .unwrap();
        assert_eq!((n, seen), (1, 3));
    }
}
