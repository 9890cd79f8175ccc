use std::ffi::c_char;
use std::fmt;

use arrow::array::{ArrayRef, RecordBatch};
use arrow::datatypes::{Field, Schema};
use colbridge_core::ownership::ResourceKind;

use crate::error::{NativeError, Result};
use crate::types::{borrow, c_str, free_raw, into_raw, owned_c_string, take_raw, Tracked};
use crate::ffi_try;

/// Column-reference expressions. Richer builders live above the bridge and
/// lower to these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Column(String),
    Alias(Box<Expr>, String),
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    pub fn alias(self, name: impl Into<String>) -> Self {
        Expr::Alias(Box::new(self), name.into())
    }

    pub fn output_name(&self) -> &str {
        match self {
            Expr::Column(name) | Expr::Alias(_, name) => name,
        }
    }

    /// Index of the input column this expression reads.
    pub(crate) fn source_index(&self, schema: &Schema) -> Result<usize> {
        match self {
            Expr::Column(name) => schema
                .index_of(name)
                .map_err(|_| NativeError::Plan(format!("column '{name}' not found"))),
            Expr::Alias(inner, _) => inner.source_index(schema),
        }
    }

    /// Output field for this expression against `schema`.
    pub(crate) fn to_field(&self, schema: &Schema) -> Result<Field> {
        let idx = self.source_index(schema)?;
        let src = schema.field(idx);
        Ok(Field::new(self.output_name(), src.data_type().clone(), src.is_nullable()))
    }

    pub(crate) fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let idx = self.source_index(batch.schema_ref())?;
        Ok(batch.column(idx).clone())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => write!(f, "col(\"{name}\")"),
            Expr::Alias(inner, name) => write!(f, "{inner}.alias(\"{name}\")"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprContext {
    pub(crate) inner: Expr,
}

impl Tracked for ExprContext {
    const KIND: ResourceKind = ResourceKind::Expr;
}

impl ExprContext {
    pub fn new(inner: Expr) -> Self {
        Self { inner }
    }
}

/// # Safety
/// `name` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn cb_expr_col(name: *const c_char) -> *mut ExprContext {
    ffi_try!(std::ptr::null_mut(), {
        let name = unsafe { c_str(name, "name")? };
        into_raw(ExprContext::new(Expr::col(name)))
    })
}

/// Consumes `expr`.
///
/// # Safety
/// `expr` must be a live expression; it is invalid after this call whatever
/// the outcome.
#[no_mangle]
pub unsafe extern "C" fn cb_expr_alias(
    expr: *mut ExprContext,
    name: *const c_char,
) -> *mut ExprContext {
    ffi_try!(std::ptr::null_mut(), {
        let expr = unsafe { take_raw(expr, "expr") };
        let name = unsafe { c_str(name, "name")? };
        into_raw(ExprContext::new(expr?.inner.alias(name)))
    })
}

/// # Safety
/// `expr` must be a live expression.
#[no_mangle]
pub unsafe extern "C" fn cb_expr_to_string(expr: *const ExprContext) -> *mut c_char {
    ffi_try!(std::ptr::null_mut(), {
        owned_c_string(unsafe { borrow(expr, "expr")? }.inner.to_string())
    })
}

/// # Safety
/// `expr` must be a live expression.
#[no_mangle]
pub unsafe extern "C" fn cb_expr_clone(expr: *const ExprContext) -> *mut ExprContext {
    ffi_try!(std::ptr::null_mut(), {
        into_raw(unsafe { borrow(expr, "expr")? }.clone())
    })
}

/// # Safety
/// `expr` must be null or a live expression not freed before.
#[no_mangle]
pub unsafe extern "C" fn cb_expr_free(expr: *mut ExprContext) {
    unsafe { free_raw(expr) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::DataType;

    #[test]
    fn alias_keeps_source_column() {
        let schema = Schema::new(vec![
            Field::new("a", DataType::Int32, false),
            Field::new("b", DataType::Utf8, true),
        ]);
        let e = Expr::col("b").alias("name");
        assert_eq!(e.output_name(), "name");
        assert_eq!(e.source_index(&schema).unwrap(), 1);
        let f = e.to_field(&schema).unwrap();
        assert_eq!(f.name(), "name");
        assert!(f.is_nullable());
        assert_eq!(e.to_string(), "col(\"b\").alias(\"name\")");
    }

    #[test]
    fn unknown_column_is_a_plan_error() {
        let schema = Schema::new(vec![Field::new("a", DataType::Int32, false)]);
        assert!(matches!(
            Expr::col("zz").source_index(&schema),
            Err(NativeError::Plan(_))
        ));
    }

    #[test]
    fn alias_consumes_even_on_bad_name() {
        let before = crate::tracking::stats(ResourceKind::Expr).freed;
        let e = into_raw(ExprContext::new(Expr::col("a")));
        let out = unsafe { cb_expr_alias(e, std::ptr::null()) };
        assert!(out.is_null());
        assert!(crate::tracking::stats(ResourceKind::Expr).freed > before);
        crate::error::clear_last_error();
    }
}
