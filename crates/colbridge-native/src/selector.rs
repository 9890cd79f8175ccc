use std::ffi::c_char;
use std::fmt;

use arrow::datatypes::Schema;
use colbridge_core::ownership::ResourceKind;

use crate::error::{NativeError, Result};
use crate::types::{borrow, c_str, c_str_array, free_raw, into_raw, take_raw, Tracked};
use crate::ffi_try;

/// Column selectors resolved against a schema at plan-build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Names(Vec<String>),
    StartsWith(String),
    Or(Box<Selector>, Box<Selector>),
    Exclude(Box<Selector>, Vec<String>),
}

impl Selector {
    fn matches(&self, name: &str) -> bool {
        match self {
            Selector::All => true,
            Selector::Names(names) => names.iter().any(|n| n == name),
            Selector::StartsWith(prefix) => name.starts_with(prefix.as_str()),
            Selector::Or(a, b) => a.matches(name) || b.matches(name),
            Selector::Exclude(inner, names) => {
                inner.matches(name) && !names.iter().any(|n| n == name)
            }
        }
    }

    /// Resolve to input column indices in schema order. Explicit names must
    /// exist.
    pub(crate) fn resolve(&self, schema: &Schema) -> Result<Vec<usize>> {
        self.check_names(schema)?;
        Ok(schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| self.matches(f.name()))
            .map(|(i, _)| i)
            .collect())
    }

    fn check_names(&self, schema: &Schema) -> Result<()> {
        match self {
            Selector::Names(names) => {
                for n in names {
                    if schema.index_of(n).is_err() {
                        return Err(NativeError::Plan(format!("column '{n}' not found")));
                    }
                }
                Ok(())
            }
            Selector::Or(a, b) => {
                a.check_names(schema)?;
                b.check_names(schema)
            }
            Selector::Exclude(inner, _) => inner.check_names(schema),
            Selector::All | Selector::StartsWith(_) => Ok(()),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::All => write!(f, "all()"),
            Selector::Names(names) => write!(f, "cols({})", names.join(", ")),
            Selector::StartsWith(p) => write!(f, "starts_with(\"{p}\")"),
            Selector::Or(a, b) => write!(f, "({a} | {b})"),
            Selector::Exclude(inner, names) => write!(f, "{inner}.exclude({})", names.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorContext {
    pub(crate) inner: Selector,
}

impl Tracked for SelectorContext {
    const KIND: ResourceKind = ResourceKind::Selector;
}

impl SelectorContext {
    pub fn new(inner: Selector) -> Self {
        Self { inner }
    }
}

#[no_mangle]
pub extern "C" fn cb_selector_all() -> *mut SelectorContext {
    into_raw(SelectorContext::new(Selector::All))
}

/// # Safety
/// `names` must point to `len` valid C strings.
#[no_mangle]
pub unsafe extern "C" fn cb_selector_cols(
    names: *const *const c_char,
    len: usize,
) -> *mut SelectorContext {
    ffi_try!(std::ptr::null_mut(), {
        let names = unsafe { c_str_array(names, len, "names")? };
        into_raw(SelectorContext::new(Selector::Names(names)))
    })
}

/// # Safety
/// `prefix` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn cb_selector_starts_with(prefix: *const c_char) -> *mut SelectorContext {
    ffi_try!(std::ptr::null_mut(), {
        let prefix = unsafe { c_str(prefix, "prefix")? };
        into_raw(SelectorContext::new(Selector::StartsWith(prefix.to_string())))
    })
}

/// Consumes both selectors.
///
/// # Safety
/// `lhs` and `rhs` must be live selectors; both are invalid after this call.
#[no_mangle]
pub unsafe extern "C" fn cb_selector_or(
    lhs: *mut SelectorContext,
    rhs: *mut SelectorContext,
) -> *mut SelectorContext {
    ffi_try!(std::ptr::null_mut(), {
        let lhs = unsafe { take_raw(lhs, "lhs") };
        let rhs = unsafe { take_raw(rhs, "rhs") };
        let (lhs, rhs) = (lhs?, rhs?);
        into_raw(SelectorContext::new(Selector::Or(
            Box::new(lhs.inner),
            Box::new(rhs.inner),
        )))
    })
}

/// Consumes `selector`.
///
/// # Safety
/// `selector` must be live; `names` must point to `len` valid C strings.
#[no_mangle]
pub unsafe extern "C" fn cb_selector_exclude(
    selector: *mut SelectorContext,
    names: *const *const c_char,
    len: usize,
) -> *mut SelectorContext {
    ffi_try!(std::ptr::null_mut(), {
        let selector = unsafe { take_raw(selector, "selector") };
        let names = unsafe { c_str_array(names, len, "names")? };
        into_raw(SelectorContext::new(Selector::Exclude(
            Box::new(selector?.inner),
            names,
        )))
    })
}

/// # Safety
/// `selector` must be a live selector.
#[no_mangle]
pub unsafe extern "C" fn cb_selector_clone(
    selector: *const SelectorContext,
) -> *mut SelectorContext {
    ffi_try!(std::ptr::null_mut(), {
        into_raw(unsafe { borrow(selector, "selector")? }.clone())
    })
}

/// # Safety
/// `selector` must be null or a live selector not freed before.
#[no_mangle]
pub unsafe extern "C" fn cb_selector_free(selector: *mut SelectorContext) {
    unsafe { free_raw(selector) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("x_a", DataType::Float64, true),
            Field::new("x_b", DataType::Float64, true),
            Field::new("label", DataType::Utf8, true),
        ])
    }

    #[test]
    fn resolves_in_schema_order() {
        let sel = Selector::Or(
            Box::new(Selector::Names(vec!["label".into()])),
            Box::new(Selector::StartsWith("x_".into())),
        );
        assert_eq!(sel.resolve(&schema()).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn exclude_removes_names() {
        let sel = Selector::Exclude(Box::new(Selector::All), vec!["id".into()]);
        assert_eq!(sel.resolve(&schema()).unwrap(), vec![1, 2, 3]);
        assert_eq!(sel.to_string(), "all().exclude(id)");
    }

    #[test]
    fn missing_explicit_name_fails() {
        let sel = Selector::Names(vec!["nope".into()]);
        assert!(sel.resolve(&schema()).is_err());
    }
}
