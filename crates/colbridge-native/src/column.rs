use std::ffi::{c_char, c_int};

use arrow::array::{make_array, Array, ArrayRef};
use arrow::datatypes::Field;
use arrow::ffi::{from_ffi, FFI_ArrowArray, FFI_ArrowSchema};
use colbridge_core::ownership::ResourceKind;

use crate::error::{NativeError, Result};
use crate::types::{borrow, borrow_mut, c_str, free_raw, into_raw, out_ptr, owned_c_string, Tracked};
use crate::{ffi_status, ffi_try};

/// A single named array.
#[derive(Debug, Clone)]
pub struct ColumnContext {
    pub(crate) field: Field,
    pub(crate) array: ArrayRef,
}

impl Tracked for ColumnContext {
    const KIND: ResourceKind = ResourceKind::Column;
}

impl ColumnContext {
    pub fn new(name: impl Into<String>, array: ArrayRef) -> Self {
        let field = Field::new(name, array.data_type().clone(), array.null_count() > 0);
        Self { field, array }
    }

    pub(crate) fn with_field(field: Field, array: ArrayRef) -> Self {
        Self { field, array }
    }

    pub fn name(&self) -> &str {
        self.field.name()
    }

    pub fn array(&self) -> &ArrayRef {
        &self.array
    }

    /// Write the array and its named field into caller-owned structs.
    ///
    /// # Safety
    /// Both pointers must be writable and hold no unreleased struct.
    pub(crate) unsafe fn export_into(
        &self,
        out_array: *mut FFI_ArrowArray,
        out_schema: *mut FFI_ArrowSchema,
    ) -> Result<()> {
        let out_array = out_ptr(out_array, "out_array")?;
        let out_schema = out_ptr(out_schema, "out_schema")?;
        let schema = FFI_ArrowSchema::try_from(&self.field)?;
        let array = FFI_ArrowArray::new(&self.array.to_data());
        unsafe {
            std::ptr::write(out_schema, schema);
            std::ptr::write(out_array, array);
        }
        Ok(())
    }
}

/// Move the array struct out of `array`, leaving a released placeholder
/// behind so the caller's copy can never be released twice.
///
/// # Safety
/// `array` must be null or point to a valid `FFI_ArrowArray`.
pub(crate) unsafe fn take_ffi_array(array: *mut FFI_ArrowArray) -> Result<FFI_ArrowArray> {
    if array.is_null() {
        return Err(NativeError::NullPointer("array"));
    }
    Ok(unsafe { std::ptr::replace(array, FFI_ArrowArray::empty()) })
}

/// Import one array: consumes `array`, borrows `schema`.
///
/// # Safety
/// `array` must be null or a valid `FFI_ArrowArray` (it is moved out even on
/// failure); `schema` must be null or a valid `FFI_ArrowSchema` describing it.
pub(crate) unsafe fn import_array(
    array: *mut FFI_ArrowArray,
    schema: *const FFI_ArrowSchema,
) -> Result<(Field, ArrayRef)> {
    let array = unsafe { take_ffi_array(array) };
    let schema = unsafe { borrow(schema, "schema")? };
    let field = Field::try_from(schema)?;
    let data = unsafe { from_ffi(array?, schema)? };
    Ok((field, make_array(data)))
}

/// Consumes `array`, borrows `schema`.
///
/// # Safety
/// See [`import_array`]; `name` must be null (keep the imported field name)
/// or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn cb_column_from_arrow(
    name: *const c_char,
    array: *mut FFI_ArrowArray,
    schema: *const FFI_ArrowSchema,
) -> *mut ColumnContext {
    ffi_try!(std::ptr::null_mut(), {
        let (field, array) = unsafe { import_array(array, schema)? };
        let field = if name.is_null() {
            field
        } else {
            field.with_name(unsafe { c_str(name, "name")? })
        };
        into_raw(ColumnContext::with_field(field, array))
    })
}

/// # Safety
/// `column` must be a live column.
#[no_mangle]
pub unsafe extern "C" fn cb_column_len(column: *const ColumnContext) -> i64 {
    ffi_try!(-1, { unsafe { borrow(column, "column")? }.array.len() as i64 })
}

/// # Safety
/// `column` must be a live column.
#[no_mangle]
pub unsafe extern "C" fn cb_column_null_count(column: *const ColumnContext) -> i64 {
    ffi_try!(-1, {
        unsafe { borrow(column, "column")? }.array.null_count() as i64
    })
}

/// # Safety
/// `column` must be a live column.
#[no_mangle]
pub unsafe extern "C" fn cb_column_name(column: *const ColumnContext) -> *mut c_char {
    ffi_try!(std::ptr::null_mut(), {
        owned_c_string(unsafe { borrow(column, "column")? }.name().to_string())
    })
}

/// Renames in place. The column stays owned by the caller.
///
/// # Safety
/// `column` must be a live column with no other outstanding borrow.
#[no_mangle]
pub unsafe extern "C" fn cb_column_rename(column: *mut ColumnContext, name: *const c_char) -> c_int {
    ffi_status!({
        let column = unsafe { borrow_mut(column, "column")? };
        let name = unsafe { c_str(name, "name")? };
        column.field = column.field.clone().with_name(name);
    })
}

/// # Safety
/// `column` must be a live column; the out structs must be writable and
/// hold no unreleased struct.
#[no_mangle]
pub unsafe extern "C" fn cb_column_export(
    column: *const ColumnContext,
    out_array: *mut FFI_ArrowArray,
    out_schema: *mut FFI_ArrowSchema,
) -> c_int {
    ffi_status!({
        let column = unsafe { borrow(column, "column")? };
        unsafe { column.export_into(out_array, out_schema)? };
    })
}

/// # Safety
/// `column` must be a live column.
#[no_mangle]
pub unsafe extern "C" fn cb_column_clone(column: *const ColumnContext) -> *mut ColumnContext {
    ffi_try!(std::ptr::null_mut(), {
        into_raw(unsafe { borrow(column, "column")? }.clone())
    })
}

/// # Safety
/// `column` must be null or a live column not freed before.
#[no_mangle]
pub unsafe extern "C" fn cb_column_free(column: *mut ColumnContext) {
    unsafe { free_raw(column) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use std::ffi::CString;
    use std::sync::Arc;

    #[test]
    fn import_moves_the_array_struct() {
        let data = Int32Array::from(vec![Some(1), None, Some(3)]).into_data();
        let mut ffi_array = FFI_ArrowArray::new(&data);
        let ffi_schema =
            FFI_ArrowSchema::try_from(&Field::new("v", data.data_type().clone(), true)).unwrap();

        let name = CString::new("renamed").unwrap();
        let col = unsafe { cb_column_from_arrow(name.as_ptr(), &mut ffi_array, &ffi_schema) };
        assert!(!col.is_null());
        // Caller's struct is left released.
        assert!(ffi_array.is_released());

        assert_eq!(unsafe { cb_column_len(col) }, 3);
        assert_eq!(unsafe { cb_column_null_count(col) }, 1);
        assert_eq!(unsafe { &*col }.name(), "renamed");
        unsafe { cb_column_free(col) };
    }

    #[test]
    fn export_then_rename_is_independent() {
        let col = into_raw(ColumnContext::new(
            "a",
            Arc::new(Int32Array::from(vec![7, 8])) as ArrayRef,
        ));
        let mut out_array = FFI_ArrowArray::empty();
        let mut out_schema = FFI_ArrowSchema::empty();
        assert_eq!(unsafe { cb_column_export(col, &mut out_array, &mut out_schema) }, 0);

        let name = CString::new("b").unwrap();
        assert_eq!(unsafe { cb_column_rename(col, name.as_ptr()) }, 0);
        assert_eq!(unsafe { &*col }.name(), "b");

        let field = Field::try_from(&out_schema).unwrap();
        assert_eq!(field.name(), "a");
        let data = unsafe { from_ffi(out_array, &out_schema) }.unwrap();
        assert_eq!(data.len(), 2);
        unsafe { cb_column_free(col) };
    }
}
