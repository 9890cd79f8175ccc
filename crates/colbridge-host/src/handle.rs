//! Ownership-tagged wrapper around one native pointer.
//!
//! A [`ResourceHandle`] is either valid and the sole owner of its pointer,
//! or invalid. Consuming calls flip it to invalid without freeing; disposal
//! frees exactly once. Every operation on an invalid handle fails with
//! [`BridgeError::InvalidHandle`] instead of handing a dangling pointer to
//! the engine.

use std::fmt;
use std::ptr::NonNull;

use colbridge_core::ownership::ResourceKind;
use colbridge_native::{
    column, datatype, expr, frame, plan, schema, selector, ColumnContext, DataTypeContext,
    ExprContext, FrameContext, PlanContext, SchemaContext, SelectorContext,
};

use crate::error::{native_call, BridgeError, Result};
use crate::metrics::{self, BridgeMetrics};

/// A native context type together with its free and clone entry points.
pub trait NativeResource {
    const KIND: ResourceKind;

    /// # Safety
    /// `ptr` must be a live pointer of this kind that nobody else owns.
    unsafe fn free(ptr: *mut Self);

    /// # Safety
    /// `ptr` must be a live pointer of this kind.
    unsafe fn clone_raw(ptr: *const Self) -> *mut Self;
}

macro_rules! native_resource {
    ($ty:ty, $kind:expr, $free:path, $clone:path) => {
        impl NativeResource for $ty {
            const KIND: ResourceKind = $kind;

            unsafe fn free(ptr: *mut Self) {
                unsafe { $free(ptr) }
            }

            unsafe fn clone_raw(ptr: *const Self) -> *mut Self {
                unsafe { $clone(ptr) }
            }
        }
    };
}

native_resource!(PlanContext, ResourceKind::Plan, plan::cb_plan_free, plan::cb_plan_clone);
native_resource!(FrameContext, ResourceKind::Frame, frame::cb_frame_free, frame::cb_frame_clone);
native_resource!(ColumnContext, ResourceKind::Column, column::cb_column_free, column::cb_column_clone);
native_resource!(ExprContext, ResourceKind::Expr, expr::cb_expr_free, expr::cb_expr_clone);
native_resource!(SchemaContext, ResourceKind::Schema, schema::cb_schema_free, schema::cb_schema_clone);
native_resource!(
    SelectorContext,
    ResourceKind::Selector,
    selector::cb_selector_free,
    selector::cb_selector_clone
);
native_resource!(
    DataTypeContext,
    ResourceKind::DataType,
    datatype::cb_datatype_free,
    datatype::cb_datatype_clone
);

pub struct ResourceHandle<R: NativeResource> {
    ptr: Option<NonNull<R>>,
}

// SAFETY: a handle is the only owner of its pointer and the engine's
// contexts carry no thread affinity. Shared access is not offered (no Sync).
unsafe impl<R: NativeResource> Send for ResourceHandle<R> {}

impl<R: NativeResource> ResourceHandle<R> {
    /// Wrap a pointer freshly returned by a native factory.
    ///
    /// # Safety
    /// `ptr` must be null or a live pointer of kind `R` owned by the caller.
    pub unsafe fn create(ptr: *mut R) -> Result<Self> {
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            BridgeError::Native(format!("engine returned a null {}", R::KIND))
        })?;
        metrics::global().record_create();
        Ok(Self { ptr: Some(ptr) })
    }

    /// Run a native factory under [`native_call`] and wrap its result.
    pub(crate) fn from_native(call: impl FnOnce() -> *mut R) -> Result<Self> {
        let ptr = native_call(call)?;
        // SAFETY: factories return null or a fresh, caller-owned pointer.
        unsafe { Self::create(ptr) }
    }

    pub fn kind(&self) -> ResourceKind {
        R::KIND
    }

    pub fn is_valid(&self) -> bool {
        self.ptr.is_some()
    }

    pub fn ensure_valid(&self) -> Result<()> {
        self.ptr
            .map(|_| ())
            .ok_or_else(|| BridgeError::invalid_handle(R::KIND))
    }

    /// Pointer for a Borrow-edge call. Validity is unchanged.
    pub fn borrow_ptr(&self) -> Result<*const R> {
        self.ptr
            .map(|p| p.as_ptr() as *const R)
            .ok_or_else(|| BridgeError::invalid_handle(R::KIND))
    }

    /// Pointer for a Borrow-edge call that mutates in place.
    pub fn borrow_mut_ptr(&mut self) -> Result<*mut R> {
        self.ptr
            .map(NonNull::as_ptr)
            .ok_or_else(|| BridgeError::invalid_handle(R::KIND))
    }

    /// Clone edge: a brand-new, independently owned handle.
    pub fn try_clone(&self) -> Result<Self> {
        self.clone_counted(metrics::global())
    }

    fn clone_counted(&self, metrics: &BridgeMetrics) -> Result<Self> {
        let ptr = self.borrow_ptr()?;
        // SAFETY: `ptr` is live for the duration of the call.
        let clone = Self::from_native(|| unsafe { R::clone_raw(ptr) })?;
        metrics.record_clone();
        Ok(clone)
    }

    /// Consume edge: hand the pointer over and mark this handle invalid
    /// without freeing. Call immediately before the consuming entry point.
    pub fn consume(&mut self) -> Result<*mut R> {
        let ptr = self
            .ptr
            .take()
            .ok_or_else(|| BridgeError::invalid_handle(R::KIND))?;
        metrics::global().record_consume();
        Ok(ptr.as_ptr())
    }

    /// Move-semantics variant of [`consume`](Self::consume).
    pub fn into_raw(mut self) -> Result<*mut R> {
        self.consume()
    }

    /// Forget the pointer without freeing it. Used when ownership moved by
    /// other means.
    pub fn invalidate(&mut self) {
        self.ptr = None;
    }

    /// Free the pointer once. A second call is a no-op.
    pub fn dispose(&mut self) -> Result<()> {
        match self.ptr.take() {
            Some(ptr) => {
                metrics::global().record_dispose();
                // SAFETY: this handle was the sole owner of `ptr`.
                native_call(|| unsafe { R::free(ptr.as_ptr()) })
            }
            None => Ok(()),
        }
    }
}

impl<R: NativeResource> Drop for ResourceHandle<R> {
    fn drop(&mut self) {
        if let Err(_e) = self.dispose() {
            #[cfg(feature = "tracing")]
            tracing::warn!(kind = %R::KIND, error = %_e, "dispose on drop failed");
        }
    }
}

impl<R: NativeResource> fmt::Debug for ResourceHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("kind", &R::KIND)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Anything that owns native memory and can release it early.
pub trait Disposable {
    fn dispose(&mut self) -> Result<()>;
}

impl<R: NativeResource> Disposable for ResourceHandle<R> {
    fn dispose(&mut self) -> Result<()> {
        ResourceHandle::dispose(self)
    }
}

/// Dispose every handle even when some fail; returns the first failure.
pub fn dispose_all<'a, I>(handles: I) -> Result<()>
where
    I: IntoIterator<Item = &'a mut dyn Disposable>,
{
    let mut first = None;
    for h in handles {
        if let Err(e) = h.dispose() {
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> ResourceHandle<SelectorContext> {
        ResourceHandle::from_native(|| selector::cb_selector_all()).unwrap()
    }

    #[test]
    fn consume_invalidates_without_freeing() {
        let mut h = selector();
        let raw = h.consume().unwrap();
        assert!(!h.is_valid());
        assert!(matches!(
            h.borrow_ptr(),
            Err(BridgeError::InvalidHandle {
                kind: ResourceKind::Selector
            })
        ));
        // Still ours to free.
        unsafe { selector::cb_selector_free(raw) };
    }

    #[test]
    fn dispose_is_idempotent() {
        let mut h = selector();
        h.dispose().unwrap();
        h.dispose().unwrap();
        assert!(!h.is_valid());
        assert!(h.try_clone().is_err());
    }

    #[test]
    fn clone_is_independent() {
        let mut a = selector();
        let b = a.try_clone().unwrap();
        a.dispose().unwrap();
        assert!(b.is_valid());
        assert!(b.borrow_ptr().is_ok());
    }

    #[test]
    fn dispose_all_visits_everything() {
        let mut a = selector();
        let mut b = selector();
        b.invalidate_for_test();
        let mut c = selector();
        dispose_all([
            &mut a as &mut dyn Disposable,
            &mut b as &mut dyn Disposable,
            &mut c as &mut dyn Disposable,
        ])
        .unwrap();
        assert!(!a.is_valid() && !c.is_valid());
    }

    /// Stands in for a native kind whose clone entry point fails.
    struct Unclonable;

    impl NativeResource for Unclonable {
        const KIND: ResourceKind = ResourceKind::Selector;

        unsafe fn free(_ptr: *mut Self) {}

        unsafe fn clone_raw(_ptr: *const Self) -> *mut Self {
            std::ptr::null_mut()
        }
    }

    #[test]
    fn failed_clone_is_not_counted() {
        let counters = BridgeMetrics::default();
        let h = ResourceHandle::<Unclonable> {
            ptr: Some(NonNull::dangling()),
        };
        assert!(matches!(h.clone_counted(&counters), Err(BridgeError::Native(_))));
        assert_eq!(counters.snapshot().handles_cloned, 0);

        let sel = selector();
        let copy = sel.clone_counted(&counters).unwrap();
        assert!(copy.is_valid());
        assert_eq!(counters.snapshot().handles_cloned, 1);
    }

    impl ResourceHandle<SelectorContext> {
        /// Leak-free invalidate for tests: free first, then forget.
        fn invalidate_for_test(&mut self) {
            if let Ok(raw) = self.consume() {
                unsafe { selector::cb_selector_free(raw) };
            }
        }
    }
}
