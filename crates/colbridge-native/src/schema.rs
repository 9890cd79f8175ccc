use std::ffi::{c_char, c_int};
use std::sync::Arc;

use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::ffi::FFI_ArrowSchema;
use colbridge_core::ownership::ResourceKind;

use crate::datatype::DataTypeContext;
use crate::error::{NativeError, Result};
use crate::types::{
    borrow, borrow_array, c_str_array, free_raw, into_raw, out_ptr, owned_c_string, Tracked,
};
use crate::{ffi_status, ffi_try};

/// Schema resource: an ordered list of named, typed fields.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaContext {
    pub(crate) inner: SchemaRef,
}

impl Tracked for SchemaContext {
    const KIND: ResourceKind = ResourceKind::Schema;
}

impl SchemaContext {
    pub fn new(inner: SchemaRef) -> Self {
        Self { inner }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.inner
    }

    fn field(&self, idx: usize) -> Result<&Field> {
        self.inner
            .fields()
            .get(idx)
            .map(|f| f.as_ref())
            .ok_or_else(|| {
                NativeError::InvalidArgument(format!(
                    "field index {idx} out of range for schema of width {}",
                    self.inner.fields().len()
                ))
            })
    }
}

/// True when both schemas have the same names, types and nullability in the
/// same order. Metadata is ignored.
pub(crate) fn same_layout(expected: &Schema, actual: &Schema) -> bool {
    expected.fields().len() == actual.fields().len()
        && expected
            .fields()
            .iter()
            .zip(actual.fields().iter())
            .all(|(e, a)| {
                e.name() == a.name()
                    && e.data_type() == a.data_type()
                    && e.is_nullable() == a.is_nullable()
            })
}

pub(crate) fn describe_layout(schema: &Schema) -> String {
    let cols: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| {
            let null = if f.is_nullable() { "?" } else { "" };
            format!("{}: {}{null}", f.name(), f.data_type())
        })
        .collect();
    format!("[{}]", cols.join(", "))
}

pub(crate) fn ensure_same_layout(expected: &Schema, actual: &Schema, ctx: &str) -> Result<()> {
    if same_layout(expected, actual) {
        Ok(())
    } else {
        Err(NativeError::SchemaMismatch(format!(
            "{ctx}: expected {}, got {}",
            describe_layout(expected),
            describe_layout(actual)
        )))
    }
}

/// Build a schema from parallel arrays. `dtypes` are borrowed; `nullable`
/// may be null, in which case every field is nullable.
///
/// # Safety
/// `names` and `dtypes` must each point to `len` valid elements; `nullable`
/// must be null or point to `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn cb_schema_new(
    names: *const *const c_char,
    dtypes: *const *const DataTypeContext,
    nullable: *const bool,
    len: usize,
) -> *mut SchemaContext {
    ffi_try!(std::ptr::null_mut(), {
        let names = unsafe { c_str_array(names, len, "names")? };
        let dtypes = unsafe { borrow_array(dtypes, len, "dtypes")? };
        let nullable: Vec<bool> = if nullable.is_null() {
            vec![true; len]
        } else {
            unsafe { std::slice::from_raw_parts(nullable, len) }.to_vec()
        };
        let fields: Vec<Field> = names
            .into_iter()
            .zip(dtypes)
            .zip(nullable)
            .map(|((name, dt), nullable)| Field::new(name, dt.inner.clone(), nullable))
            .collect();
        let schema = Schema::new(fields);
        check_unique_names(&schema)?;
        into_raw(SchemaContext::new(Arc::new(schema)))
    })
}

pub(crate) fn check_unique_names(schema: &Schema) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for f in schema.fields() {
        if !seen.insert(f.name().as_str()) {
            return Err(NativeError::Plan(format!("duplicate column name '{}'", f.name())));
        }
    }
    Ok(())
}

/// Import a schema from a borrowed Arrow struct (a struct-typed root).
///
/// # Safety
/// `schema` must be null or a valid, unreleased `FFI_ArrowSchema`.
#[no_mangle]
pub unsafe extern "C" fn cb_schema_from_arrow(schema: *const FFI_ArrowSchema) -> *mut SchemaContext {
    ffi_try!(std::ptr::null_mut(), {
        let raw = unsafe { borrow(schema, "schema")? };
        let schema = Schema::try_from(raw)?;
        check_unique_names(&schema)?;
        into_raw(SchemaContext::new(Arc::new(schema)))
    })
}

/// Number of fields, or -1 on a null pointer.
///
/// # Safety
/// `schema` must be a live schema.
#[no_mangle]
pub unsafe extern "C" fn cb_schema_len(schema: *const SchemaContext) -> i64 {
    ffi_try!(-1, {
        unsafe { borrow(schema, "schema")? }.inner.fields().len() as i64
    })
}

/// # Safety
/// `schema` must be a live schema.
#[no_mangle]
pub unsafe extern "C" fn cb_schema_field_name(
    schema: *const SchemaContext,
    idx: usize,
) -> *mut c_char {
    ffi_try!(std::ptr::null_mut(), {
        let schema = unsafe { borrow(schema, "schema")? };
        owned_c_string(schema.field(idx)?.name().clone())
    })
}

/// Returns a new, owned type descriptor for field `idx`.
///
/// # Safety
/// `schema` must be a live schema.
#[no_mangle]
pub unsafe extern "C" fn cb_schema_field_dtype(
    schema: *const SchemaContext,
    idx: usize,
) -> *mut DataTypeContext {
    ffi_try!(std::ptr::null_mut(), {
        let schema = unsafe { borrow(schema, "schema")? };
        into_raw(DataTypeContext::new(schema.field(idx)?.data_type().clone()))
    })
}

/// # Safety
/// `schema` must be a live schema; `out` must be writable and hold no
/// unreleased struct.
#[no_mangle]
pub unsafe extern "C" fn cb_schema_export(
    schema: *const SchemaContext,
    out: *mut FFI_ArrowSchema,
) -> c_int {
    ffi_status!({
        let schema = unsafe { borrow(schema, "schema")? };
        let out = out_ptr(out, "out")?;
        let exported = FFI_ArrowSchema::try_from(schema.inner.as_ref())?;
        unsafe { std::ptr::write(out, exported) };
    })
}

/// # Safety
/// `schema` must be a live schema.
#[no_mangle]
pub unsafe extern "C" fn cb_schema_clone(schema: *const SchemaContext) -> *mut SchemaContext {
    ffi_try!(std::ptr::null_mut(), {
        into_raw(unsafe { borrow(schema, "schema")? }.clone())
    })
}

/// # Safety
/// `schema` must be null or a live schema not freed before.
#[no_mangle]
pub unsafe extern "C" fn cb_schema_free(schema: *mut SchemaContext) {
    unsafe { free_raw(schema) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::DataType;
    use std::ffi::{CStr, CString};

    #[test]
    fn new_borrows_dtypes() {
        let a = CString::new("a").unwrap();
        let b = CString::new("b").unwrap();
        let names = [a.as_ptr(), b.as_ptr()];
        let i64_ty = into_raw(DataTypeContext::new(DataType::Int64));
        let utf8 = into_raw(DataTypeContext::new(DataType::Utf8));
        let dtypes = [i64_ty as *const _, utf8 as *const _];
        let nullable = [false, true];

        let schema =
            unsafe { cb_schema_new(names.as_ptr(), dtypes.as_ptr(), nullable.as_ptr(), 2) };
        assert!(!schema.is_null());
        assert_eq!(unsafe { cb_schema_len(schema) }, 2);

        // dtypes stay valid after the call
        assert_eq!(unsafe { &*i64_ty }.inner, DataType::Int64);

        let name = unsafe { cb_schema_field_name(schema, 1) };
        assert_eq!(unsafe { CStr::from_ptr(name) }.to_str().unwrap(), "b");
        unsafe { crate::error::cb_string_free(name) };

        let s = unsafe { &*schema };
        assert!(!s.inner.field(0).is_nullable());

        unsafe {
            cb_schema_free(schema);
            crate::datatype::cb_datatype_free(i64_ty);
            crate::datatype::cb_datatype_free(utf8);
        }
    }

    #[test]
    fn out_of_range_field_fails() {
        let schema = into_raw(SchemaContext::new(Arc::new(Schema::empty())));
        let name = unsafe { cb_schema_field_name(schema, 3) };
        assert!(name.is_null());
        assert!(crate::error::take_last_error().unwrap().contains("out of range"));
        unsafe { cb_schema_free(schema) };
    }

    #[test]
    fn layout_check_ignores_metadata_only() {
        let a = Schema::new(vec![Field::new("k", DataType::Int32, true)]);
        let b = Schema::new(vec![Field::new("key", DataType::Int32, true)]);
        assert!(same_layout(&a, &a.clone()));
        let err = ensure_same_layout(&a, &b, "batch 4").unwrap_err();
        assert!(matches!(err, NativeError::SchemaMismatch(_)));
        assert!(err.to_string().contains("key: Int32?"));
    }
}
