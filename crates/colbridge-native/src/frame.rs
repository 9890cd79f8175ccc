use std::ffi::{c_char, c_int};
use std::sync::Arc;

use arrow::array::{new_empty_array, Array, ArrayRef, RecordBatch, StructArray};
use arrow::compute::concat;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ffi::{FFI_ArrowArray, FFI_ArrowSchema};
use arrow::ffi_stream::{ArrowArrayStreamReader, FFI_ArrowArrayStream};
use colbridge_core::ownership::ResourceKind;

use crate::column::{import_array, ColumnContext};
use crate::error::{NativeError, Result};
use crate::schema::{check_unique_names, ensure_same_layout, SchemaContext};
use crate::types::{borrow, c_str, free_raw, into_raw, out_ptr, Tracked};
use crate::{ffi_status, ffi_try};

/// Materialized table: a schema plus the batches that carry it.
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub(crate) schema: SchemaRef,
    pub(crate) batches: Vec<RecordBatch>,
}

impl Tracked for FrameContext {
    const KIND: ResourceKind = ResourceKind::Frame;
}

impl FrameContext {
    /// Every batch must match `schema` exactly; empty batches are dropped.
    pub fn try_new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self> {
        check_unique_names(&schema)?;
        let mut kept = Vec::with_capacity(batches.len());
        for (i, batch) in batches.into_iter().enumerate() {
            ensure_same_layout(&schema, batch.schema_ref(), &format!("frame batch {i}"))?;
            if batch.num_rows() > 0 {
                kept.push(batch);
            }
        }
        Ok(Self {
            schema,
            batches: kept,
        })
    }

    pub fn empty(schema: SchemaRef) -> Self {
        Self {
            schema,
            batches: Vec::new(),
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn height(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    pub fn width(&self) -> usize {
        self.schema.fields().len()
    }

    /// One column across every batch, concatenated.
    pub fn column(&self, name: &str) -> Result<ColumnContext> {
        let idx = self
            .schema
            .index_of(name)
            .map_err(|_| NativeError::InvalidArgument(format!("column '{name}' not found")))?;
        let field = self.schema.field(idx).clone();
        let array: ArrayRef = match self.batches.as_slice() {
            [] => new_empty_array(field.data_type()),
            [only] => only.column(idx).clone(),
            many => {
                let parts: Vec<&dyn Array> = many.iter().map(|b| b.column(idx).as_ref()).collect();
                concat(&parts)?
            }
        };
        Ok(ColumnContext::with_field(field, array))
    }

    /// Frame from one imported array: a struct array becomes one column per
    /// child, anything else a single column.
    fn from_array(field: Field, array: ArrayRef) -> Result<Self> {
        match field.data_type() {
            DataType::Struct(_) => {
                let struct_array = array
                    .as_any()
                    .downcast_ref::<StructArray>()
                    .ok_or_else(|| NativeError::InvalidArgument("expected a struct array".into()))?
                    .clone();
                if struct_array.null_count() > 0 {
                    return Err(NativeError::InvalidArgument(
                        "top-level struct array must not contain nulls".into(),
                    ));
                }
                let batch = RecordBatch::from(struct_array);
                Self::try_new(batch.schema(), vec![batch])
            }
            _ => {
                let schema = Arc::new(Schema::new(vec![field]));
                let batch = RecordBatch::try_new(schema.clone(), vec![array])?;
                Self::try_new(schema, vec![batch])
            }
        }
    }

    /// Export batch `idx` as a struct array plus its schema.
    ///
    /// # Safety
    /// Both pointers must be writable and hold no unreleased struct.
    pub(crate) unsafe fn export_batch(
        &self,
        idx: usize,
        out_array: *mut FFI_ArrowArray,
        out_schema: *mut FFI_ArrowSchema,
    ) -> Result<()> {
        let batch = self.batches.get(idx).ok_or_else(|| {
            NativeError::InvalidArgument(format!(
                "batch index {idx} out of range for frame with {} batches",
                self.batches.len()
            ))
        })?;
        unsafe { export_record_batch(batch, out_array, out_schema) }
    }
}

/// Write `batch` as a struct array plus schema into caller-owned structs.
///
/// # Safety
/// Both pointers must be writable and hold no unreleased struct.
pub(crate) unsafe fn export_record_batch(
    batch: &RecordBatch,
    out_array: *mut FFI_ArrowArray,
    out_schema: *mut FFI_ArrowSchema,
) -> Result<()> {
    let out_array = out_ptr(out_array, "out_array")?;
    let out_schema = out_ptr(out_schema, "out_schema")?;
    let schema = FFI_ArrowSchema::try_from(batch.schema_ref().as_ref())?;
    let array = FFI_ArrowArray::new(&StructArray::from(batch.clone()).into_data());
    unsafe {
        std::ptr::write(out_schema, schema);
        std::ptr::write(out_array, array);
    }
    Ok(())
}

/// Consumes `array`, borrows `schema`.
///
/// # Safety
/// `array` must be null or a valid `FFI_ArrowArray`; `schema` must be null
/// or a valid `FFI_ArrowSchema` describing it.
#[no_mangle]
pub unsafe extern "C" fn cb_frame_from_arrow(
    array: *mut FFI_ArrowArray,
    schema: *const FFI_ArrowSchema,
) -> *mut FrameContext {
    ffi_try!(std::ptr::null_mut(), {
        let (field, array) = unsafe { import_array(array, schema)? };
        into_raw(FrameContext::from_array(field, array)?)
    })
}

/// Drain a C stream into a frame. Consumes the stream.
///
/// # Safety
/// `stream` must be null or a valid `FFI_ArrowArrayStream`; it is left
/// released.
#[no_mangle]
pub unsafe extern "C" fn cb_frame_from_stream(stream: *mut FFI_ArrowArrayStream) -> *mut FrameContext {
    ffi_try!(std::ptr::null_mut(), {
        if stream.is_null() {
            return Err(NativeError::NullPointer("stream"));
        }
        let stream = unsafe { std::ptr::replace(stream, FFI_ArrowArrayStream::empty()) };
        let reader = ArrowArrayStreamReader::try_new(stream)?;
        let schema = arrow::record_batch::RecordBatchReader::schema(&reader);
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        into_raw(FrameContext::try_new(schema, batches)?)
    })
}

/// # Safety
/// `frame` must be a live frame.
#[no_mangle]
pub unsafe extern "C" fn cb_frame_height(frame: *const FrameContext) -> i64 {
    ffi_try!(-1, { unsafe { borrow(frame, "frame")? }.height() as i64 })
}

/// # Safety
/// `frame` must be a live frame.
#[no_mangle]
pub unsafe extern "C" fn cb_frame_width(frame: *const FrameContext) -> i64 {
    ffi_try!(-1, { unsafe { borrow(frame, "frame")? }.width() as i64 })
}

/// # Safety
/// `frame` must be a live frame.
#[no_mangle]
pub unsafe extern "C" fn cb_frame_num_batches(frame: *const FrameContext) -> i64 {
    ffi_try!(-1, {
        unsafe { borrow(frame, "frame")? }.batches.len() as i64
    })
}

/// New, owned schema of the frame.
///
/// # Safety
/// `frame` must be a live frame.
#[no_mangle]
pub unsafe extern "C" fn cb_frame_schema(frame: *const FrameContext) -> *mut SchemaContext {
    ffi_try!(std::ptr::null_mut(), {
        let frame = unsafe { borrow(frame, "frame")? };
        into_raw(SchemaContext::new(frame.schema.clone()))
    })
}

/// New, owned column by name.
///
/// # Safety
/// `frame` must be a live frame; `name` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn cb_frame_column(
    frame: *const FrameContext,
    name: *const c_char,
) -> *mut ColumnContext {
    ffi_try!(std::ptr::null_mut(), {
        let frame = unsafe { borrow(frame, "frame")? };
        let name = unsafe { c_str(name, "name")? };
        into_raw(frame.column(name)?)
    })
}

/// # Safety
/// `frame` must be a live frame; the out structs must be writable and hold
/// no unreleased struct.
#[no_mangle]
pub unsafe extern "C" fn cb_frame_export_batch(
    frame: *const FrameContext,
    idx: usize,
    out_array: *mut FFI_ArrowArray,
    out_schema: *mut FFI_ArrowSchema,
) -> c_int {
    ffi_status!({
        let frame = unsafe { borrow(frame, "frame")? };
        unsafe { frame.export_batch(idx, out_array, out_schema)? };
    })
}

/// # Safety
/// `frame` must be a live frame.
#[no_mangle]
pub unsafe extern "C" fn cb_frame_clone(frame: *const FrameContext) -> *mut FrameContext {
    ffi_try!(std::ptr::null_mut(), {
        into_raw(unsafe { borrow(frame, "frame")? }.clone())
    })
}

/// # Safety
/// `frame` must be null or a live frame not freed before.
#[no_mangle]
pub unsafe extern "C" fn cb_frame_free(frame: *mut FrameContext) {
    unsafe { free_raw(frame) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use std::ffi::CString;

    fn sample() -> FrameContext {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("s", DataType::Utf8, true),
        ]));
        let b1 = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("a"), None])),
            ],
        )
        .unwrap();
        let b2 = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![3])),
                Arc::new(StringArray::from(vec![Some("c")])),
            ],
        )
        .unwrap();
        FrameContext::try_new(schema, vec![b1, b2]).unwrap()
    }

    #[test]
    fn column_concatenates_batches() {
        let frame = into_raw(sample());
        let name = CString::new("k").unwrap();
        let col = unsafe { cb_frame_column(frame, name.as_ptr()) };
        assert_eq!(unsafe { crate::column::cb_column_len(col) }, 3);
        assert_eq!(unsafe { cb_frame_height(frame) }, 3);
        assert_eq!(unsafe { cb_frame_width(frame) }, 2);
        unsafe {
            crate::column::cb_column_free(col);
            cb_frame_free(frame);
        }
    }

    #[test]
    fn struct_array_roundtrip_through_export() {
        let frame = into_raw(sample());
        let mut array = FFI_ArrowArray::empty();
        let mut schema = FFI_ArrowSchema::empty();
        assert_eq!(unsafe { cb_frame_export_batch(frame, 0, &mut array, &mut schema) }, 0);

        let back = unsafe { cb_frame_from_arrow(&mut array, &schema) };
        assert!(!back.is_null());
        let back_ref = unsafe { &*back };
        assert_eq!(back_ref.height(), 2);
        assert_eq!(back_ref.schema, unsafe { &*frame }.schema);
        unsafe {
            cb_frame_free(back);
            cb_frame_free(frame);
        }
    }

    #[test]
    fn export_out_of_range_fails() {
        let frame = into_raw(sample());
        let mut array = FFI_ArrowArray::empty();
        let mut schema = FFI_ArrowSchema::empty();
        assert_eq!(unsafe { cb_frame_export_batch(frame, 9, &mut array, &mut schema) }, -1);
        assert!(crate::error::take_last_error().unwrap().contains("out of range"));
        unsafe { cb_frame_free(frame) };
    }

    #[test]
    fn mismatched_batch_is_rejected() {
        let frame = sample();
        let other = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        let res = FrameContext::try_new(other, frame.batches.clone());
        assert!(matches!(res, Err(NativeError::SchemaMismatch(_))));
    }
}
