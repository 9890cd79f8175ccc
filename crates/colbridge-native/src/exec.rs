//! Pull-based execution on a dedicated engine thread.
//!
//! Every node compiles to a boxed iterator of batches. Scan nodes open a new
//! host pass each time they are executed, so a plan that reads the same scan
//! twice (a self-join) asks the host for two independent streams.

use std::collections::HashMap;
use std::ffi::{c_int, c_void};
use std::sync::Arc;

use arrow::array::{new_null_array, Array, ArrayRef, RecordBatch, RecordBatchOptions, UInt32Array};
use arrow::compute::{concat_batches, take};
use arrow::datatypes::SchemaRef;
use arrow::ffi::{FFI_ArrowArray, FFI_ArrowSchema};
use arrow::row::{RowConverter, Rows, SortField};
use colbridge_core::ownership::JoinType;

use crate::error::{NativeError, Result};
use crate::expr::Expr;
use crate::frame::{export_record_batch, FrameContext};
use crate::plan::PlanNode;
use crate::types::SendPtr;

/// Name of the thread every execution runs on.
pub const ENGINE_THREAD_NAME: &str = "colbridge-engine";

/// Receives one output batch. The callee moves both structs out (leaving
/// released placeholders); whatever is left is released by the engine
/// afterwards. Non-zero aborts execution.
pub type PushBatchCallback = unsafe extern "C" fn(
    user_data: *mut c_void,
    array: *mut FFI_ArrowArray,
    schema: *mut FFI_ArrowSchema,
) -> c_int;

pub(crate) type BatchStream<'a> = Box<dyn Iterator<Item = Result<RecordBatch>> + 'a>;

/// Run `f` on a scoped engine thread and wait for it. A panic on that thread
/// comes back as [`NativeError::Panic`].
pub(crate) fn run_on_engine_thread<T, F>(f: F) -> Result<T>
where
    T: Send,
    F: FnOnce() -> Result<T> + Send,
{
    std::thread::scope(|scope| {
        let handle = std::thread::Builder::new()
            .name(ENGINE_THREAD_NAME.to_string())
            .spawn_scoped(scope, f)
            .map_err(|e| NativeError::Exec(format!("failed to start engine thread: {e}")))?;
        handle
            .join()
            .unwrap_or_else(|payload| Err(NativeError::from_panic(payload)))
    })
}

pub(crate) fn collect(root: PlanNode) -> Result<FrameContext> {
    run_on_engine_thread(move || {
        let schema = root.schema();
        let batches = execute(&root)?.collect::<Result<Vec<_>>>()?;
        #[cfg(feature = "tracing")]
        tracing::debug!(batches = batches.len(), "plan collected");
        FrameContext::try_new(schema, batches)
    })
}

/// Push every non-empty batch to `push`; returns the number delivered.
pub(crate) fn sink(root: PlanNode, push: PushBatchCallback, user_data: SendPtr) -> Result<usize> {
    run_on_engine_thread(move || {
        let mut delivered = 0usize;
        for batch in execute(&root)? {
            let batch = batch?;
            if batch.num_rows() == 0 {
                continue;
            }
            let mut array = FFI_ArrowArray::empty();
            let mut schema = FFI_ArrowSchema::empty();
            // SAFETY: both out-parameters are valid and empty.
            unsafe { export_record_batch(&batch, &mut array, &mut schema)? };
            // SAFETY: the host guarantees `push` accepts `user_data` on this
            // thread while the sink call is in progress.
            let rc = unsafe { push(user_data.get(), &mut array, &mut schema) };
            if rc != 0 {
                return Err(NativeError::Callback(format!(
                    "sink rejected batch {delivered} (code {rc})"
                )));
            }
            delivered += 1;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(delivered, "sink finished");
        Ok(delivered)
    })
}

/// Compile `node` into a batch iterator. Scan passes are opened here.
pub(crate) fn execute(node: &PlanNode) -> Result<BatchStream<'_>> {
    match node {
        PlanNode::Frame(frame) => Ok(Box::new(frame.batches.clone().into_iter().map(Ok))),
        PlanNode::Scan(scan) => Ok(Box::new(scan.open_pass()?)),
        PlanNode::Select {
            input,
            indices,
            schema,
            ..
        }
        | PlanNode::SelectBy {
            input,
            indices,
            schema,
            ..
        } => {
            let schema = schema.clone();
            let input = execute(input)?;
            Ok(Box::new(input.map(move |batch| {
                let batch = batch?;
                let columns = indices.iter().map(|&i| batch.column(i).clone()).collect();
                with_schema(&schema, columns, batch.num_rows())
            })))
        }
        PlanNode::Limit { input, n } => Ok(Box::new(Limit {
            input: execute(input)?,
            remaining: *n,
        })),
        PlanNode::Concat { inputs, schema } => {
            let streams = inputs.iter().map(execute).collect::<Result<Vec<_>>>()?;
            let schema = schema.clone();
            Ok(Box::new(streams.into_iter().flatten().map(move |batch| {
                let batch = batch?;
                with_schema(&schema, batch.columns().to_vec(), batch.num_rows())
            })))
        }
        PlanNode::Join {
            left,
            right,
            left_on,
            right_on,
            how,
            schema,
        } => {
            // Build side first: the right input is drained into one batch.
            let right_schema = right.schema();
            let right_batches = execute(right)?.collect::<Result<Vec<_>>>()?;
            let build = concat_batches(&right_schema, &right_batches)?;
            let probe = execute(left)?;
            Ok(Box::new(HashJoin::try_new(
                probe,
                build,
                left_on,
                right_on,
                *how,
                schema.clone(),
            )?))
        }
    }
}

fn with_schema(schema: &SchemaRef, columns: Vec<ArrayRef>, rows: usize) -> Result<RecordBatch> {
    let options = RecordBatchOptions::new().with_row_count(Some(rows));
    Ok(RecordBatch::try_new_with_options(
        schema.clone(),
        columns,
        &options,
    )?)
}

struct Limit<'a> {
    input: BatchStream<'a>,
    remaining: usize,
}

impl Iterator for Limit<'_> {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let batch = match self.input.next()? {
            Ok(b) => b,
            Err(e) => return Some(Err(e)),
        };
        let take = batch.num_rows().min(self.remaining);
        self.remaining -= take;
        Some(Ok(batch.slice(0, take)))
    }
}

/// Row-encoded join keys of the build side, ignoring rows with a null key.
struct KeyTable {
    converter: RowConverter,
    rows: HashMap<Box<[u8]>, Vec<u32>>,
}

impl KeyTable {
    fn build(build: &RecordBatch, keys: &[Expr]) -> Result<Self> {
        let arrays = evaluate(keys, build)?;
        let fields = arrays
            .iter()
            .map(|a| SortField::new(a.data_type().clone()))
            .collect();
        let converter = RowConverter::new(fields)?;
        let encoded = converter.convert_columns(&arrays)?;
        let mut rows: HashMap<Box<[u8]>, Vec<u32>> = HashMap::new();
        for i in 0..build.num_rows() {
            if has_null(&arrays, i) {
                continue;
            }
            rows.entry(encoded.row(i).as_ref().into())
                .or_default()
                .push(i as u32);
        }
        Ok(Self { converter, rows })
    }

    fn encode(&self, keys: &[ArrayRef]) -> Result<Rows> {
        Ok(self.converter.convert_columns(keys)?)
    }
}

fn evaluate(keys: &[Expr], batch: &RecordBatch) -> Result<Vec<ArrayRef>> {
    keys.iter().map(|k| k.evaluate(batch)).collect()
}

fn has_null(keys: &[ArrayRef], row: usize) -> bool {
    keys.iter().any(|a| a.is_null(row))
}

struct HashJoin<'a> {
    probe: Option<BatchStream<'a>>,
    build: RecordBatch,
    table: Option<KeyTable>,
    left_on: Vec<Expr>,
    how: JoinType,
    schema: SchemaRef,
    /// Build rows matched so far; only tracked for full joins.
    matched: Vec<bool>,
}

impl<'a> HashJoin<'a> {
    fn try_new(
        probe: BatchStream<'a>,
        build: RecordBatch,
        left_on: &[Expr],
        right_on: &[Expr],
        how: JoinType,
        schema: SchemaRef,
    ) -> Result<Self> {
        let table = match how {
            JoinType::Cross => None,
            _ => Some(KeyTable::build(&build, right_on)?),
        };
        let matched = if how == JoinType::Full {
            vec![false; build.num_rows()]
        } else {
            Vec::new()
        };
        Ok(Self {
            probe: Some(probe),
            build,
            table,
            left_on: left_on.to_vec(),
            how,
            schema,
            matched,
        })
    }

    fn join_batch(&mut self, left: &RecordBatch) -> Result<RecordBatch> {
        let mut left_idx: Vec<u32> = Vec::new();
        let mut right_idx: Vec<Option<u32>> = Vec::new();

        match &self.table {
            None => {
                for l in 0..left.num_rows() as u32 {
                    for r in 0..self.build.num_rows() as u32 {
                        left_idx.push(l);
                        right_idx.push(Some(r));
                    }
                }
            }
            Some(table) => {
                let keys = evaluate(&self.left_on, left)?;
                let encoded = table.encode(&keys)?;
                for l in 0..left.num_rows() {
                    let hits = if has_null(&keys, l) {
                        None
                    } else {
                        table.rows.get(encoded.row(l).as_ref())
                    };
                    match (self.how, hits) {
                        (JoinType::Semi, Some(_)) | (JoinType::Anti, None) => {
                            left_idx.push(l as u32);
                        }
                        (JoinType::Semi, None) | (JoinType::Anti, Some(_)) => {}
                        (_, Some(hits)) => {
                            for &r in hits {
                                left_idx.push(l as u32);
                                right_idx.push(Some(r));
                                if let Some(m) = self.matched.get_mut(r as usize) {
                                    *m = true;
                                }
                            }
                        }
                        (JoinType::Left | JoinType::Full, None) => {
                            left_idx.push(l as u32);
                            right_idx.push(None);
                        }
                        (_, None) => {}
                    }
                }
            }
        }

        let left_take = UInt32Array::from(left_idx);
        let mut columns = left
            .columns()
            .iter()
            .map(|c| take(c.as_ref(), &left_take, None))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if !matches!(self.how, JoinType::Semi | JoinType::Anti) {
            let right_take = UInt32Array::from(right_idx);
            for c in self.build.columns() {
                columns.push(take(c.as_ref(), &right_take, None)?);
            }
        }
        with_schema(&self.schema, columns, left_take.len())
    }

    /// Build rows never matched, padded with nulls on the left.
    fn unmatched_build_rows(&mut self) -> Result<Option<RecordBatch>> {
        let idx: Vec<u32> = std::mem::take(&mut self.matched)
            .into_iter()
            .enumerate()
            .filter(|(_, hit)| !hit)
            .map(|(i, _)| i as u32)
            .collect();
        if idx.is_empty() {
            return Ok(None);
        }
        let n = idx.len();
        let right_take = UInt32Array::from(idx);
        let left_width = self.schema.fields().len() - self.build.num_columns();
        let mut columns: Vec<ArrayRef> = self.schema.fields()[..left_width]
            .iter()
            .map(|f| new_null_array(f.data_type(), n))
            .collect();
        for c in self.build.columns() {
            columns.push(take(c.as_ref(), &right_take, None)?);
        }
        with_schema(&self.schema, columns, n).map(Some)
    }
}

impl Iterator for HashJoin<'_> {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let probe = self.probe.as_mut()?;
            match probe.next() {
                Some(Ok(batch)) => match self.join_batch(&batch) {
                    Ok(out) if out.num_rows() == 0 => continue,
                    other => return Some(other),
                },
                Some(Err(e)) => {
                    self.probe = None;
                    return Some(Err(e));
                }
                None => {
                    self.probe = None;
                    if self.how == JoinType::Full {
                        return self.unmatched_build_rows().transpose();
                    }
                    return None;
                }
            }
        }
    }
}

/// Frame-backed plans for the tests below.
#[cfg(test)]
pub(crate) fn frame_plan(batches: Vec<RecordBatch>) -> PlanNode {
    let schema = batches[0].schema();
    PlanNode::Frame(FrameContext::try_new(schema, batches).unwrap())
}
