//! Host-side errors and the last-error discipline around native calls.

use std::ffi::{c_int, CStr};

use arrow::error::ArrowError;
use colbridge_core::ownership::ResourceKind;
use colbridge_native::error::{cb_last_error_clear, cb_last_error_take, cb_string_free};
use thiserror::Error;

/// Result type local to the bridge.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// `Clone` so one fault can be reported both to a pull consumer and to the
/// caller of the sink.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("{kind} handle used after it was consumed or disposed")]
    InvalidHandle { kind: ResourceKind },

    #[error("native engine error: {0}")]
    Native(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("scan source failed: {0}")]
    Source(String),

    #[error("consumer failed: {0}")]
    Consumer(String),

    #[error("consumer closed the stream")]
    ConsumerClosed,

    #[error("arrow error: {0}")]
    Arrow(String),

    #[error(transparent)]
    Core(#[from] colbridge_core::Error),
}

impl From<ArrowError> for BridgeError {
    fn from(e: ArrowError) -> Self {
        BridgeError::Arrow(e.to_string())
    }
}

impl BridgeError {
    pub(crate) fn invalid_handle(kind: ResourceKind) -> Self {
        #[cfg(feature = "tracing")]
        tracing::error!(%kind, "operation on an invalid handle");
        BridgeError::InvalidHandle { kind }
    }

    /// Wrap for transport through an Arrow stream; see [`BridgeError::from_arrow`].
    pub(crate) fn into_arrow(self) -> ArrowError {
        ArrowError::ExternalError(Box::new(self))
    }

    /// Recover a bridge error that travelled through Arrow, or wrap a foreign one.
    pub(crate) fn from_arrow(e: ArrowError) -> Self {
        match e {
            ArrowError::ExternalError(inner) => match inner.downcast::<BridgeError>() {
                Ok(b) => *b,
                Err(other) => BridgeError::Source(other.to_string()),
            },
            other => BridgeError::Source(other.to_string()),
        }
    }
}

/// Take and clear the native last-error slot.
pub fn take_native_error() -> Option<String> {
    let raw = cb_last_error_take();
    if raw.is_null() {
        return None;
    }
    // SAFETY: non-null strings from the slot are valid, owned C strings.
    let msg = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
    unsafe { cb_string_free(raw) };
    Some(msg)
}

pub fn check_last_error() -> Result<()> {
    match take_native_error() {
        Some(msg) => Err(BridgeError::Native(msg)),
        None => Ok(()),
    }
}

/// Clear the slot, perform `call`, then take and clear it again. A message
/// left by the call becomes [`BridgeError::Native`].
pub fn native_call<T>(call: impl FnOnce() -> T) -> Result<T> {
    cb_last_error_clear();
    let out = call();
    check_last_error()?;
    Ok(out)
}

/// [`native_call`] for entry points returning a status code.
pub(crate) fn native_status(call: impl FnOnce() -> c_int) -> Result<()> {
    let rc = native_call(call)?;
    if rc != 0 {
        return Err(BridgeError::Native(format!("native call failed with code {rc}")));
    }
    Ok(())
}

/// Render a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_call_surfaces_and_clears_the_slot() {
        colbridge_native::error::set_last_error(&colbridge_native::NativeError::Plan(
            "stale".into(),
        ));
        // Stale messages from before the call are discarded.
        assert_eq!(native_call(|| 5).unwrap(), 5);

        let err = native_call(|| {
            colbridge_native::error::set_last_error(&colbridge_native::NativeError::Exec(
                "boom".into(),
            ))
        })
        .unwrap_err();
        assert!(matches!(err, BridgeError::Native(ref m) if m.contains("boom")));
        assert!(take_native_error().is_none());
    }

    #[test]
    fn bridge_errors_survive_arrow_transport() {
        let original = BridgeError::SchemaMismatch("renamed column".into());
        let back = BridgeError::from_arrow(original.into_arrow());
        assert!(matches!(back, BridgeError::SchemaMismatch(_)));
    }

    #[test]
    fn invalid_handle_names_the_kind() {
        let err = BridgeError::invalid_handle(ResourceKind::Selector);
        assert_eq!(
            err.to_string(),
            "selector handle used after it was consumed or disposed"
        );
    }
}
