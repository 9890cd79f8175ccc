//! Raw-pointer plumbing shared by every entry point.
//!
//! Each resource context is boxed, counted in [`crate::tracking`], and handed
//! out as `*mut Context`. Consuming entry points reclaim the box with
//! [`take_raw`]; borrowing ones only dereference with [`borrow`].

use std::ffi::{c_char, c_void, CStr};

use colbridge_core::ownership::ResourceKind;

use crate::error::{to_c_string, NativeError, Result};
use crate::tracking;

/// A context type that can cross the ABI as an owned pointer.
pub trait Tracked: Sized {
    const KIND: ResourceKind;
}

pub(crate) fn into_raw<T: Tracked>(value: T) -> *mut T {
    tracking::record_alloc(T::KIND);
    Box::into_raw(Box::new(value))
}

/// Reclaim ownership of `ptr`.
///
/// # Safety
/// `ptr` must be null or a live pointer produced by [`into_raw`] for `T`.
pub(crate) unsafe fn take_raw<T: Tracked>(ptr: *mut T, what: &'static str) -> Result<T> {
    if ptr.is_null() {
        return Err(NativeError::NullPointer(what));
    }
    tracking::record_free(T::KIND);
    // SAFETY: non-null and produced by `Box::into_raw` per the contract above.
    Ok(*unsafe { Box::from_raw(ptr) })
}

/// Null-tolerant free used by every `cb_<kind>_free`.
///
/// # Safety
/// Same as [`take_raw`].
pub(crate) unsafe fn free_raw<T: Tracked>(ptr: *mut T) {
    if !ptr.is_null() {
        drop(unsafe { take_raw(ptr, "free") });
    }
}

/// # Safety
/// `ptr` must be null or point to a live `T` for the whole of `'a`.
pub(crate) unsafe fn borrow<'a, T>(ptr: *const T, what: &'static str) -> Result<&'a T> {
    unsafe { ptr.as_ref() }.ok_or(NativeError::NullPointer(what))
}

/// Check an out-parameter before writing through it.
pub(crate) fn out_ptr<T>(ptr: *mut T, what: &'static str) -> Result<*mut T> {
    if ptr.is_null() {
        Err(NativeError::NullPointer(what))
    } else {
        Ok(ptr)
    }
}

/// # Safety
/// As [`borrow`], and no other reference to `*ptr` may exist.
pub(crate) unsafe fn borrow_mut<'a, T>(ptr: *mut T, what: &'static str) -> Result<&'a mut T> {
    unsafe { ptr.as_mut() }.ok_or(NativeError::NullPointer(what))
}

/// Take ownership of every non-null element of a pointer array before
/// reporting any null, so a failing consume call never leaks.
///
/// # Safety
/// `ptrs` must be null or point to `len` pointers, each null or produced by
/// [`into_raw`] for `T`.
pub(crate) unsafe fn take_array<T: Tracked>(
    ptrs: *const *mut T,
    len: usize,
    what: &'static str,
) -> Result<Vec<T>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if ptrs.is_null() {
        return Err(NativeError::NullPointer(what));
    }
    // SAFETY: caller guarantees `len` readable elements.
    let raw = unsafe { std::slice::from_raw_parts(ptrs, len) };
    let taken: Vec<Result<T>> = raw.iter().map(|&p| unsafe { take_raw(p, what) }).collect();
    taken.into_iter().collect()
}

/// # Safety
/// `ptrs` must be null or point to `len` pointers, each null or live for `'a`.
pub(crate) unsafe fn borrow_array<'a, T>(
    ptrs: *const *const T,
    len: usize,
    what: &'static str,
) -> Result<Vec<&'a T>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if ptrs.is_null() {
        return Err(NativeError::NullPointer(what));
    }
    let raw = unsafe { std::slice::from_raw_parts(ptrs, len) };
    raw.iter().map(|&p| unsafe { borrow(p, what) }).collect()
}

/// # Safety
/// `ptr` must be null or a NUL-terminated string live for `'a`.
pub(crate) unsafe fn c_str<'a>(ptr: *const c_char, what: &'static str) -> Result<&'a str> {
    if ptr.is_null() {
        return Err(NativeError::NullPointer(what));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|e| NativeError::InvalidArgument(format!("`{what}` is not UTF-8: {e}")))
}

/// # Safety
/// `ptrs` must be null or point to `len` valid C strings.
pub(crate) unsafe fn c_str_array(
    ptrs: *const *const c_char,
    len: usize,
    what: &'static str,
) -> Result<Vec<String>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    if ptrs.is_null() {
        return Err(NativeError::NullPointer(what));
    }
    let raw = unsafe { std::slice::from_raw_parts(ptrs, len) };
    raw.iter()
        .map(|&p| unsafe { c_str(p, what) }.map(str::to_string))
        .collect()
}

/// Owned C string for the host; release with `cb_string_free`.
pub(crate) fn owned_c_string(s: String) -> *mut c_char {
    to_c_string(s).into_raw()
}

/// Opaque host pointer carried onto the engine thread.
#[derive(Clone, Copy)]
pub(crate) struct SendPtr(*mut c_void);

// SAFETY: the host guarantees its user data may be used from the engine
// thread while the owning call blocks.
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl SendPtr {
    pub(crate) fn new(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    pub(crate) fn get(self) -> *mut c_void {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    struct Dummy(u32);

    impl Tracked for Dummy {
        const KIND: ResourceKind = ResourceKind::Expr;
    }

    #[test]
    fn take_array_reclaims_everything_before_failing() {
        let before = tracking::stats(ResourceKind::Expr);
        let a = into_raw(Dummy(1));
        let b = into_raw(Dummy(2));
        let ptrs = [a, std::ptr::null_mut(), b];
        let res = unsafe { take_array(ptrs.as_ptr(), ptrs.len(), "exprs") };
        assert!(matches!(res, Err(NativeError::NullPointer("exprs"))));
        let after = tracking::stats(ResourceKind::Expr);
        assert!(after.freed - before.freed >= 2);
    }

    #[test]
    fn take_array_keeps_order() {
        let ptrs = [into_raw(Dummy(1)), into_raw(Dummy(2))];
        let got = unsafe { take_array(ptrs.as_ptr(), 2, "exprs") }.unwrap();
        assert_eq!(got.iter().map(|d| d.0).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn c_strings_are_validated() {
        let s = CString::new("col").unwrap();
        assert_eq!(unsafe { c_str(s.as_ptr(), "name") }.unwrap(), "col");
        assert!(unsafe { c_str(std::ptr::null(), "name") }.is_err());
    }
}
