//! Engine errors and the thread-local last-error slot.
//!
//! Entry points never unwind and never return a Rust `Result` across the ABI.
//! A failing call stores its message here and returns a null pointer or a
//! non-zero status; the host reads and clears the slot right after the call.

use std::any::Any;
use std::cell::RefCell;
use std::ffi::{c_char, CString};

use arrow::error::ArrowError;
use thiserror::Error;

/// Result type local to the engine.
pub type Result<T> = std::result::Result<T, NativeError>;

#[derive(Debug, Error)]
pub enum NativeError {
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("null pointer passed as `{0}`")]
    NullPointer(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("plan error: {0}")]
    Plan(String),

    #[error("execution error: {0}")]
    Exec(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("callback error: {0}")]
    Callback(String),

    #[error("panic in engine: {0}")]
    Panic(String),
}

impl NativeError {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        NativeError::Panic(msg)
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Store `err` in this thread's slot, replacing any earlier message.
pub fn set_last_error(err: &NativeError) {
    #[cfg(feature = "tracing")]
    tracing::debug!(error = %err, "native call failed");

    let msg = to_c_string(err.to_string());
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(msg));
}

/// Take the pending message, leaving the slot empty.
pub fn take_last_error() -> Option<String> {
    LAST_ERROR
        .with(|slot| slot.borrow_mut().take())
        .map(|s| s.to_string_lossy().into_owned())
}

pub fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

/// Interior NUL bytes are replaced so the message always survives.
pub(crate) fn to_c_string(s: String) -> CString {
    match CString::new(s) {
        Ok(c) => c,
        Err(e) => {
            let bytes: Vec<u8> = e
                .into_vec()
                .into_iter()
                .map(|b| if b == 0 { b'?' } else { b })
                .collect();
            // No NUL bytes remain.
            CString::new(bytes).unwrap_or_default()
        }
    }
}

/// Run an entry-point body, converting both `Err` and panics into the
/// last-error slot plus `$default`.
#[macro_export]
#[doc(hidden)]
macro_rules! ffi_try {
    ($default:expr, $body:block) => {{
        match ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(
            || -> $crate::error::Result<_> { Ok($body) },
        )) {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                $crate::error::set_last_error(&err);
                $default
            }
            Err(payload) => {
                $crate::error::set_last_error(&$crate::error::NativeError::from_panic(payload));
                $default
            }
        }
    }};
}

/// Status-returning variant of [`ffi_try!`]: `0` on success, `-1` on failure.
#[macro_export]
#[doc(hidden)]
macro_rules! ffi_status {
    ($body:block) => {{
        $crate::ffi_try!(-1, {
            $body;
            0
        })
    }};
}

/// Returns the pending error message (owned, free with [`cb_string_free`])
/// and clears the slot. Null when no error is pending.
#[no_mangle]
pub extern "C" fn cb_last_error_take() -> *mut c_char {
    LAST_ERROR
        .with(|slot| slot.borrow_mut().take())
        .map_or(std::ptr::null_mut(), CString::into_raw)
}

#[no_mangle]
pub extern "C" fn cb_last_error_clear() {
    clear_last_error();
}

/// # Safety
/// `s` must be null or a string returned by this library that was not freed yet.
#[no_mangle]
pub unsafe extern "C" fn cb_string_free(s: *mut c_char) {
    if !s.is_null() {
        // SAFETY: the pointer came from `CString::into_raw` in this crate.
        drop(unsafe { CString::from_raw(s) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_cleared_after_take() {
        set_last_error(&NativeError::Plan("boom".into()));
        assert_eq!(take_last_error().as_deref(), Some("plan error: boom"));
        assert_eq!(take_last_error(), None);
    }

    #[test]
    fn panics_are_caught_and_reported() {
        clear_last_error();
        let out: i32 = ffi_try!(-7, {
            if true {
                panic!("kaboom");
            }
            1
        });
        assert_eq!(out, -7);
        let msg = take_last_error().unwrap();
        assert!(msg.contains("kaboom"), "{msg}");
    }

    #[test]
    fn status_macro_reports_errors() {
        clear_last_error();
        let ok: i32 = ffi_status!({});
        assert_eq!(ok, 0);
        let failed: i32 = ffi_status!({
            Err::<(), _>(NativeError::NullPointer("plan"))?;
        });
        assert_eq!(failed, -1);
        assert!(take_last_error().unwrap().contains("`plan`"));
    }

    #[test]
    fn nul_bytes_are_replaced() {
        let c = to_c_string("a\0b".to_string());
        assert_eq!(c.to_str().unwrap(), "a?b");
    }
}
