use std::ffi::{c_char, c_int};

use arrow::datatypes::DataType;
use arrow::ffi::FFI_ArrowSchema;
use colbridge_core::ownership::ResourceKind;

use crate::types::{borrow, free_raw, into_raw, out_ptr, owned_c_string, Tracked};
use crate::{ffi_status, ffi_try};

/// Type descriptor resource.
#[derive(Debug, Clone, PartialEq)]
pub struct DataTypeContext {
    pub(crate) inner: DataType,
}

impl Tracked for DataTypeContext {
    const KIND: ResourceKind = ResourceKind::DataType;
}

impl DataTypeContext {
    pub fn new(inner: DataType) -> Self {
        Self { inner }
    }

    pub fn data_type(&self) -> &DataType {
        &self.inner
    }
}

/// Import a type from a borrowed Arrow schema struct. The caller keeps the
/// release obligation for `schema`.
///
/// # Safety
/// `schema` must be null or a valid, unreleased `FFI_ArrowSchema`.
#[no_mangle]
pub unsafe extern "C" fn cb_datatype_from_arrow(
    schema: *const FFI_ArrowSchema,
) -> *mut DataTypeContext {
    ffi_try!(std::ptr::null_mut(), {
        let schema = unsafe { borrow(schema, "schema")? };
        into_raw(DataTypeContext::new(DataType::try_from(schema)?))
    })
}

/// Export the type into `out`, which the caller owns afterwards.
///
/// # Safety
/// `dt` must be a live type descriptor; `out` must be writable and hold no
/// unreleased struct.
#[no_mangle]
pub unsafe extern "C" fn cb_datatype_export(
    dt: *const DataTypeContext,
    out: *mut FFI_ArrowSchema,
) -> c_int {
    ffi_status!({
        let dt = unsafe { borrow(dt, "dt")? };
        let out = out_ptr(out, "out")?;
        let exported = FFI_ArrowSchema::try_from(&dt.inner)?;
        unsafe { std::ptr::write(out, exported) };
    })
}

/// # Safety
/// `dt` must be a live type descriptor.
#[no_mangle]
pub unsafe extern "C" fn cb_datatype_to_string(dt: *const DataTypeContext) -> *mut c_char {
    ffi_try!(std::ptr::null_mut(), {
        let dt = unsafe { borrow(dt, "dt")? };
        owned_c_string(dt.inner.to_string())
    })
}

/// # Safety
/// `dt` must be a live type descriptor.
#[no_mangle]
pub unsafe extern "C" fn cb_datatype_clone(dt: *const DataTypeContext) -> *mut DataTypeContext {
    ffi_try!(std::ptr::null_mut(), {
        into_raw(unsafe { borrow(dt, "dt")? }.clone())
    })
}

/// # Safety
/// `dt` must be null or a live type descriptor not freed before.
#[no_mangle]
pub unsafe extern "C" fn cb_datatype_free(dt: *mut DataTypeContext) {
    unsafe { free_raw(dt) }
}
