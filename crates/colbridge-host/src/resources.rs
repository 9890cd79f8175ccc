//! Typed wrappers over the native resource kinds.
//!
//! Ownership edges show up in the signatures: a Consume edge takes the
//! wrapper by value, a Borrow edge takes `&self`, a Clone edge is
//! `try_clone`. Inputs passed by value belong to the call: when a consuming
//! method fails, the inputs it took are disposed of along with the error.

use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use arrow::array::{make_array, Array, ArrayRef, RecordBatch, RecordBatchIterator};
use arrow::datatypes::{DataType as ArrowType, Field as ArrowField, Schema, SchemaRef};
use arrow::ffi::{from_ffi, FFI_ArrowArray, FFI_ArrowSchema};
use arrow::ffi_stream::FFI_ArrowArrayStream;
use colbridge_core::ownership::JoinType;
use colbridge_core::schema::{DataType, SchemaDescriptor};
use colbridge_native::error::cb_string_free;
use colbridge_native::{
    column, datatype, expr, frame, plan, schema, selector, ColumnContext, DataTypeContext,
    ExprContext, FrameContext, PlanContext, SchemaContext, SelectorContext,
};

use crate::error::{native_call, native_status, BridgeError, Result};
use crate::handle::{Disposable, ResourceHandle};
use crate::schema_bridge;
use crate::source::{self, SourceShared};

pub(crate) fn c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| BridgeError::InvalidArgument(format!("{s:?} contains a NUL byte")))
}

fn c_strings(names: &[&str]) -> Result<Vec<CString>> {
    names.iter().map(|n| c_string(n)).collect()
}

/// Copy and free a string returned by the engine.
fn take_string(raw: *mut c_char) -> Result<String> {
    if raw.is_null() {
        return Err(BridgeError::Native("engine returned a null string".into()));
    }
    // SAFETY: non-null strings from the engine are owned, NUL-terminated.
    let s = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
    unsafe { cb_string_free(raw) };
    Ok(s)
}

fn count(n: i64) -> Result<usize> {
    usize::try_from(n).map_err(|_| BridgeError::Native(format!("engine returned count {n}")))
}

macro_rules! wrapper_common {
    ($ty:ident, $ctx:ty) => {
        impl $ty {
            pub(crate) fn from_handle(handle: ResourceHandle<$ctx>) -> Self {
                Self { handle }
            }

            /// Clone edge: an independent copy of the native resource.
            pub fn try_clone(&self) -> Result<Self> {
                Ok(Self {
                    handle: self.handle.try_clone()?,
                })
            }

            pub fn is_valid(&self) -> bool {
                self.handle.is_valid()
            }

            pub fn handle(&self) -> &ResourceHandle<$ctx> {
                &self.handle
            }
        }

        impl Disposable for $ty {
            fn dispose(&mut self) -> Result<()> {
                self.handle.dispose()
            }
        }
    };
}

// ---------------------------------------------------------------------------
// DataTypeHandle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DataTypeHandle {
    handle: ResourceHandle<DataTypeContext>,
}

wrapper_common!(DataTypeHandle, DataTypeContext);

impl DataTypeHandle {
    pub fn from_arrow(dt: &ArrowType) -> Result<Self> {
        let raw = FFI_ArrowSchema::try_from(dt)?;
        ResourceHandle::from_native(|| unsafe { datatype::cb_datatype_from_arrow(&raw) })
            .map(Self::from_handle)
    }

    pub fn from_descriptor(dt: &DataType) -> Result<Self> {
        Self::from_arrow(&schema_bridge::to_arrow_type(dt)?)
    }

    pub fn to_arrow(&self) -> Result<ArrowType> {
        let ptr = self.handle.borrow_ptr()?;
        let mut out = FFI_ArrowSchema::empty();
        native_status(|| unsafe { datatype::cb_datatype_export(ptr, &mut out) })?;
        Ok(ArrowType::try_from(&out)?)
    }

    pub fn to_descriptor(&self) -> Result<DataType> {
        schema_bridge::from_arrow_type(&self.to_arrow()?)
    }

    /// Engine rendering of the type, e.g. `Int64`.
    pub fn describe(&self) -> Result<String> {
        let ptr = self.handle.borrow_ptr()?;
        take_string(native_call(|| unsafe { datatype::cb_datatype_to_string(ptr) })?)
    }
}

// ---------------------------------------------------------------------------
// SchemaHandle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SchemaHandle {
    handle: ResourceHandle<SchemaContext>,
}

wrapper_common!(SchemaHandle, SchemaContext);

impl SchemaHandle {
    /// Build from `(name, type, nullable)` triples. Types are borrowed.
    pub fn new(fields: &[(&str, &DataTypeHandle, bool)]) -> Result<Self> {
        let names = fields
            .iter()
            .map(|(n, _, _)| c_string(n))
            .collect::<Result<Vec<_>>>()?;
        let name_ptrs: Vec<*const c_char> = names.iter().map(|n| n.as_ptr()).collect();
        let dtypes = fields
            .iter()
            .map(|(_, dt, _)| dt.handle.borrow_ptr())
            .collect::<Result<Vec<_>>>()?;
        let nullable: Vec<bool> = fields.iter().map(|(_, _, n)| *n).collect();
        ResourceHandle::from_native(|| unsafe {
            schema::cb_schema_new(
                name_ptrs.as_ptr(),
                dtypes.as_ptr(),
                nullable.as_ptr(),
                fields.len(),
            )
        })
        .map(Self::from_handle)
    }

    pub fn from_arrow(schema: &Schema) -> Result<Self> {
        let raw = FFI_ArrowSchema::try_from(schema)?;
        ResourceHandle::from_native(|| unsafe { schema::cb_schema_from_arrow(&raw) })
            .map(Self::from_handle)
    }

    /// The engine only reads the exported struct (a Borrow edge in
    /// `ARROW_EDGES`); `raw` is released here when it drops.
    pub fn from_descriptor(desc: &SchemaDescriptor) -> Result<Self> {
        let raw = schema_bridge::export_schema(desc)?;
        ResourceHandle::from_native(|| unsafe { schema::cb_schema_from_arrow(&raw) })
            .map(Self::from_handle)
    }

    pub fn len(&self) -> Result<usize> {
        let ptr = self.handle.borrow_ptr()?;
        count(native_call(|| unsafe { schema::cb_schema_len(ptr) })?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn field_name(&self, idx: usize) -> Result<String> {
        let ptr = self.handle.borrow_ptr()?;
        take_string(native_call(|| unsafe { schema::cb_schema_field_name(ptr, idx) })?)
    }

    /// New, owned type descriptor of field `idx`.
    pub fn field_dtype(&self, idx: usize) -> Result<DataTypeHandle> {
        let ptr = self.handle.borrow_ptr()?;
        ResourceHandle::from_native(|| unsafe { schema::cb_schema_field_dtype(ptr, idx) })
            .map(DataTypeHandle::from_handle)
    }

    pub fn to_arrow(&self) -> Result<SchemaRef> {
        let ptr = self.handle.borrow_ptr()?;
        let mut out = FFI_ArrowSchema::empty();
        native_status(|| unsafe { schema::cb_schema_export(ptr, &mut out) })?;
        Ok(Arc::new(Schema::try_from(&out)?))
    }

    pub fn to_descriptor(&self) -> Result<SchemaDescriptor> {
        let ptr = self.handle.borrow_ptr()?;
        let mut out = FFI_ArrowSchema::empty();
        native_status(|| unsafe { schema::cb_schema_export(ptr, &mut out) })?;
        // SAFETY: `out` was just filled by the engine and is ours to release.
        unsafe { schema_bridge::import_schema(&mut out) }
    }
}

// ---------------------------------------------------------------------------
// Expr
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Expr {
    handle: ResourceHandle<ExprContext>,
}

wrapper_common!(Expr, ExprContext);

impl Expr {
    pub fn col(name: &str) -> Result<Self> {
        let name = c_string(name)?;
        ResourceHandle::from_native(|| unsafe { expr::cb_expr_col(name.as_ptr()) })
            .map(Self::from_handle)
    }

    pub fn alias(mut self, name: &str) -> Result<Self> {
        let name = c_string(name)?;
        let ptr = self.handle.consume()?;
        ResourceHandle::from_native(|| unsafe { expr::cb_expr_alias(ptr, name.as_ptr()) })
            .map(Self::from_handle)
    }

    pub fn describe(&self) -> Result<String> {
        let ptr = self.handle.borrow_ptr()?;
        take_string(native_call(|| unsafe { expr::cb_expr_to_string(ptr) })?)
    }
}

fn consume_exprs(exprs: Vec<Expr>) -> Result<Vec<*mut ExprContext>> {
    exprs.into_iter().map(|mut e| e.handle.consume()).collect()
}

fn ensure_exprs(exprs: &[Expr]) -> Result<()> {
    exprs.iter().try_for_each(|e| e.handle.ensure_valid())
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Selector {
    handle: ResourceHandle<SelectorContext>,
}

wrapper_common!(Selector, SelectorContext);

impl Selector {
    pub fn all() -> Result<Self> {
        ResourceHandle::from_native(|| selector::cb_selector_all()).map(Self::from_handle)
    }

    pub fn cols(names: &[&str]) -> Result<Self> {
        let owned = c_strings(names)?;
        let ptrs: Vec<*const c_char> = owned.iter().map(|n| n.as_ptr()).collect();
        ResourceHandle::from_native(|| unsafe { selector::cb_selector_cols(ptrs.as_ptr(), ptrs.len()) })
            .map(Self::from_handle)
    }

    pub fn starts_with(prefix: &str) -> Result<Self> {
        let prefix = c_string(prefix)?;
        ResourceHandle::from_native(|| unsafe { selector::cb_selector_starts_with(prefix.as_ptr()) })
            .map(Self::from_handle)
    }

    pub fn or(mut self, mut other: Selector) -> Result<Self> {
        self.handle.ensure_valid()?;
        other.handle.ensure_valid()?;
        let (lhs, rhs) = (self.handle.consume()?, other.handle.consume()?);
        ResourceHandle::from_native(|| unsafe { selector::cb_selector_or(lhs, rhs) })
            .map(Self::from_handle)
    }

    pub fn exclude(mut self, names: &[&str]) -> Result<Self> {
        let owned = c_strings(names)?;
        let ptrs: Vec<*const c_char> = owned.iter().map(|n| n.as_ptr()).collect();
        let sel = self.handle.consume()?;
        ResourceHandle::from_native(|| unsafe {
            selector::cb_selector_exclude(sel, ptrs.as_ptr(), ptrs.len())
        })
        .map(Self::from_handle)
    }
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Column {
    handle: ResourceHandle<ColumnContext>,
}

wrapper_common!(Column, ColumnContext);

impl Column {
    /// Hand a copy-free view of `array` to the engine as a named column.
    pub fn from_array(name: &str, array: &dyn Array) -> Result<Self> {
        let field = ArrowField::new(name, array.data_type().clone(), true);
        let raw_schema = FFI_ArrowSchema::try_from(&field)?;
        let mut raw_array = FFI_ArrowArray::new(&array.to_data());
        ResourceHandle::from_native(|| unsafe {
            column::cb_column_from_arrow(std::ptr::null(), &mut raw_array, &raw_schema)
        })
        .map(Self::from_handle)
    }

    pub fn len(&self) -> Result<usize> {
        let ptr = self.handle.borrow_ptr()?;
        count(native_call(|| unsafe { column::cb_column_len(ptr) })?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn null_count(&self) -> Result<usize> {
        let ptr = self.handle.borrow_ptr()?;
        count(native_call(|| unsafe { column::cb_column_null_count(ptr) })?)
    }

    pub fn name(&self) -> Result<String> {
        let ptr = self.handle.borrow_ptr()?;
        take_string(native_call(|| unsafe { column::cb_column_name(ptr) })?)
    }

    /// Rename in place; the column stays ours.
    pub fn rename(&mut self, name: &str) -> Result<()> {
        let name = c_string(name)?;
        let ptr = self.handle.borrow_mut_ptr()?;
        native_status(|| unsafe { column::cb_column_rename(ptr, name.as_ptr()) })
    }

    pub fn to_array(&self) -> Result<ArrayRef> {
        let ptr = self.handle.borrow_ptr()?;
        let mut array = FFI_ArrowArray::empty();
        let mut raw_schema = FFI_ArrowSchema::empty();
        native_status(|| unsafe { column::cb_column_export(ptr, &mut array, &mut raw_schema) })?;
        // SAFETY: both structs were filled by the engine and describe each other.
        let data = unsafe { from_ffi(array, &raw_schema)? };
        Ok(make_array(data))
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Frame {
    handle: ResourceHandle<FrameContext>,
}

wrapper_common!(Frame, FrameContext);

impl Frame {
    pub fn from_batch(batch: &RecordBatch) -> Result<Self> {
        let (mut array, raw_schema) = schema_bridge::export_batch(batch)?;
        ResourceHandle::from_native(|| unsafe { frame::cb_frame_from_arrow(&mut array, &raw_schema) })
            .map(Self::from_handle)
    }

    /// Drain `batches` through a C stream into one frame.
    pub fn from_batches(schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self> {
        let reader = RecordBatchIterator::new(batches.into_iter().map(Ok), schema);
        let mut stream = FFI_ArrowArrayStream::new(Box::new(reader));
        ResourceHandle::from_native(|| unsafe { frame::cb_frame_from_stream(&mut stream) })
            .map(Self::from_handle)
    }

    pub fn height(&self) -> Result<usize> {
        let ptr = self.handle.borrow_ptr()?;
        count(native_call(|| unsafe { frame::cb_frame_height(ptr) })?)
    }

    pub fn width(&self) -> Result<usize> {
        let ptr = self.handle.borrow_ptr()?;
        count(native_call(|| unsafe { frame::cb_frame_width(ptr) })?)
    }

    pub fn num_batches(&self) -> Result<usize> {
        let ptr = self.handle.borrow_ptr()?;
        count(native_call(|| unsafe { frame::cb_frame_num_batches(ptr) })?)
    }

    pub fn schema(&self) -> Result<SchemaHandle> {
        let ptr = self.handle.borrow_ptr()?;
        ResourceHandle::from_native(|| unsafe { frame::cb_frame_schema(ptr) })
            .map(SchemaHandle::from_handle)
    }

    pub fn column(&self, name: &str) -> Result<Column> {
        let name = c_string(name)?;
        let ptr = self.handle.borrow_ptr()?;
        ResourceHandle::from_native(|| unsafe { frame::cb_frame_column(ptr, name.as_ptr()) })
            .map(Column::from_handle)
    }

    pub fn export_batch(&self, idx: usize) -> Result<RecordBatch> {
        let ptr = self.handle.borrow_ptr()?;
        let mut array = FFI_ArrowArray::empty();
        let mut raw_schema = FFI_ArrowSchema::empty();
        native_status(|| unsafe { frame::cb_frame_export_batch(ptr, idx, &mut array, &mut raw_schema) })?;
        // SAFETY: filled by the engine as a struct array plus its schema.
        unsafe { schema_bridge::import_batch(array, &raw_schema) }
    }

    pub fn to_batches(&self) -> Result<Vec<RecordBatch>> {
        (0..self.num_batches()?).map(|i| self.export_batch(i)).collect()
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A lazy query plan. Carries the scan sources it reads from so their
/// faults can be reported after execution.
#[derive(Debug)]
pub struct Plan {
    pub(crate) handle: ResourceHandle<PlanContext>,
    pub(crate) sources: Vec<Arc<SourceShared>>,
}

impl Plan {
    pub(crate) fn from_parts(
        handle: ResourceHandle<PlanContext>,
        sources: Vec<Arc<SourceShared>>,
    ) -> Self {
        Self { handle, sources }
    }

    /// Give up the native pointer for a consuming call.
    pub(crate) fn into_parts(mut self) -> Result<(*mut PlanContext, Vec<Arc<SourceShared>>)> {
        let ptr = self.handle.consume()?;
        Ok((ptr, std::mem::take(&mut self.sources)))
    }

    pub fn from_frame(mut frame: Frame) -> Result<Self> {
        let ptr = frame.handle.consume()?;
        let handle = ResourceHandle::from_native(|| unsafe { plan::cb_plan_from_frame(ptr) })?;
        Ok(Self::from_parts(handle, Vec::new()))
    }

    pub fn select(self, exprs: Vec<Expr>) -> Result<Self> {
        self.handle.ensure_valid()?;
        ensure_exprs(&exprs)?;
        let (ptr, sources) = self.into_parts()?;
        let raw = consume_exprs(exprs)?;
        let handle = ResourceHandle::from_native(|| unsafe {
            plan::cb_plan_select(ptr, raw.as_ptr(), raw.len())
        })?;
        Ok(Self::from_parts(handle, sources))
    }

    pub fn select_by(self, mut selector: Selector) -> Result<Self> {
        self.handle.ensure_valid()?;
        selector.handle.ensure_valid()?;
        let (ptr, sources) = self.into_parts()?;
        let sel = selector.handle.consume()?;
        let handle = ResourceHandle::from_native(|| unsafe { plan::cb_plan_select_by(ptr, sel) })?;
        Ok(Self::from_parts(handle, sources))
    }

    /// Hash join on pairwise key expressions. `Cross` takes no keys.
    pub fn join(
        self,
        right: Plan,
        left_on: Vec<Expr>,
        right_on: Vec<Expr>,
        how: JoinType,
    ) -> Result<Self> {
        self.handle.ensure_valid()?;
        right.handle.ensure_valid()?;
        ensure_exprs(&left_on)?;
        ensure_exprs(&right_on)?;
        let (lhs, mut sources) = self.into_parts()?;
        let (rhs, right_sources) = right.into_parts()?;
        sources.extend(right_sources);
        let (left_on, right_on) = (consume_exprs(left_on)?, consume_exprs(right_on)?);
        let handle = ResourceHandle::from_native(|| unsafe {
            plan::cb_plan_join(
                lhs,
                rhs,
                left_on.as_ptr(),
                left_on.len(),
                right_on.as_ptr(),
                right_on.len(),
                how.code(),
            )
        })?;
        Ok(Self::from_parts(handle, sources))
    }

    pub fn limit(self, n: usize) -> Result<Self> {
        let (ptr, sources) = self.into_parts()?;
        let handle = ResourceHandle::from_native(|| unsafe { plan::cb_plan_limit(ptr, n) })?;
        Ok(Self::from_parts(handle, sources))
    }

    /// Vertical concatenation; all inputs must share one layout.
    pub fn concat(plans: Vec<Plan>) -> Result<Self> {
        plans.iter().try_for_each(|p| p.handle.ensure_valid())?;
        let mut raw = Vec::with_capacity(plans.len());
        let mut sources = Vec::new();
        for p in plans {
            let (ptr, s) = p.into_parts()?;
            raw.push(ptr);
            sources.extend(s);
        }
        let handle =
            ResourceHandle::from_native(|| unsafe { plan::cb_plan_concat(raw.as_ptr(), raw.len()) })?;
        Ok(Self::from_parts(handle, sources))
    }

    pub fn schema_handle(&self) -> Result<SchemaHandle> {
        let ptr = self.handle.borrow_ptr()?;
        ResourceHandle::from_native(|| unsafe { plan::cb_plan_schema(ptr) })
            .map(SchemaHandle::from_handle)
    }

    pub fn schema(&self) -> Result<SchemaDescriptor> {
        self.schema_handle()?.to_descriptor()
    }

    pub fn arrow_schema(&self) -> Result<SchemaRef> {
        self.schema_handle()?.to_arrow()
    }

    pub fn explain(&self) -> Result<String> {
        let ptr = self.handle.borrow_ptr()?;
        take_string(native_call(|| unsafe { plan::cb_plan_explain(ptr) })?)
    }

    /// Execute and materialize. A scan source fault raised by this execution
    /// wins over the engine's generic stream error.
    pub fn collect(self) -> Result<Frame> {
        let (ptr, sources) = self.into_parts()?;
        match ResourceHandle::from_native(|| unsafe { plan::cb_plan_collect(ptr) }) {
            Ok(handle) => Ok(Frame::from_handle(handle)),
            Err(e) => Err(source::claim_fault(&sources, &e).unwrap_or(e)),
        }
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::from_parts(self.handle.try_clone()?, self.sources.clone()))
    }

    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }

    pub fn handle(&self) -> &ResourceHandle<PlanContext> {
        &self.handle
    }
}

impl Disposable for Plan {
    fn dispose(&mut self) -> Result<()> {
        self.handle.dispose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            ArrowField::new("k", ArrowType::Int64, true),
            ArrowField::new("v", ArrowType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![0, 1, 2])),
                Arc::new(StringArray::from(vec!["a", "b", "c"])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::from_batch(&batch()).unwrap();
        assert_eq!(frame.height().unwrap(), 3);
        assert_eq!(frame.width().unwrap(), 2);
        let back = frame.export_batch(0).unwrap();
        assert_eq!(back, batch());
    }

    #[test]
    fn test_select_with_alias() {
        let plan = Plan::from_frame(Frame::from_batch(&batch()).unwrap()).unwrap();
        let exprs = vec![Expr::col("v").unwrap().alias("name").unwrap()];
        let plan = plan.select(exprs).unwrap();
        let desc = plan.schema().unwrap();
        assert_eq!(desc.names().collect::<Vec<_>>(), vec!["name"]);
        let frame = plan.collect().unwrap();
        assert_eq!(frame.height().unwrap(), 3);
    }

    #[test]
    fn test_rejected_consume_leaves_clones_alive() {
        let mut plan = Plan::from_frame(Frame::from_batch(&batch()).unwrap()).unwrap();
        plan.dispose().unwrap();
        let expr = Expr::col("k").unwrap();
        let keep = expr.try_clone().unwrap();
        let err = plan.select(vec![expr]).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidHandle { .. }));
        assert!(keep.is_valid());
    }

    #[test]
    fn test_column_rename_and_export() {
        let values = Int64Array::from(vec![Some(1), None, Some(3)]);
        let mut col = Column::from_array("x", &values).unwrap();
        assert_eq!(col.null_count().unwrap(), 1);
        col.rename("y").unwrap();
        assert_eq!(col.name().unwrap(), "y");
        let arr = col.to_array().unwrap();
        assert_eq!(arr.len(), 3);
    }

    #[test]
    fn test_selector_composition() {
        let sel = Selector::starts_with("k")
            .unwrap()
            .or(Selector::cols(&["v"]).unwrap())
            .unwrap()
            .exclude(&["k"])
            .unwrap();
        let plan = Plan::from_frame(Frame::from_batch(&batch()).unwrap())
            .unwrap()
            .select_by(sel)
            .unwrap();
        assert_eq!(plan.schema().unwrap().names().collect::<Vec<_>>(), vec!["v"]);
    }

    #[test]
    fn test_nul_in_name_is_invalid_argument() {
        assert!(matches!(
            Expr::col("a\0b"),
            Err(BridgeError::InvalidArgument(_))
        ));
    }
}
