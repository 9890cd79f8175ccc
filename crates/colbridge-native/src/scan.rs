//! Host-driven scans over the Arrow C stream interface.
//!
//! A [`StreamScan`] owns the host's user data for as long as any plan refers
//! to it. Each execution of a scan node opens a fresh pass: the host's open
//! callback hands back a new `FFI_ArrowArrayStream`, which the engine drains
//! and releases. Self-joins and other multi-pass plans simply open more
//! passes over the same scan.

use std::ffi::{c_int, c_void};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use arrow::ffi_stream::{ArrowArrayStreamReader, FFI_ArrowArrayStream};
use arrow::record_batch::RecordBatchReader;

use crate::error::{NativeError, Result};
use crate::schema::ensure_same_layout;
use crate::types::SendPtr;

/// Fill `out` with a fresh stream for one pass. Non-zero means the host
/// could not start the pass.
pub type OpenStreamCallback =
    unsafe extern "C" fn(user_data: *mut c_void, out: *mut FFI_ArrowArrayStream) -> c_int;

/// Called exactly once when the engine drops the scan.
pub type ReleaseUserDataCallback = unsafe extern "C" fn(user_data: *mut c_void);

pub struct StreamScan {
    schema: SchemaRef,
    open: OpenStreamCallback,
    release: Option<ReleaseUserDataCallback>,
    user_data: SendPtr,
    passes: AtomicUsize,
}

impl StreamScan {
    /// Takes over `user_data` immediately: `release` runs when the scan is
    /// dropped, including when construction fails.
    pub(crate) fn try_new(
        schema: Option<SchemaRef>,
        open: Option<OpenStreamCallback>,
        release: Option<ReleaseUserDataCallback>,
        user_data: *mut c_void,
    ) -> Result<Self> {
        let guard = ReleaseGuard {
            release,
            user_data: SendPtr::new(user_data),
        };
        let open = open.ok_or(NativeError::NullPointer("open_cb"))?;
        let schema = schema.ok_or(NativeError::NullPointer("schema"))?;
        Ok(Self {
            schema,
            open,
            release: guard.disarm(),
            user_data: SendPtr::new(user_data),
            passes: AtomicUsize::new(0),
        })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Passes opened so far.
    pub fn passes(&self) -> usize {
        self.passes.load(Ordering::Acquire)
    }

    pub(crate) fn open_pass(self: &Arc<Self>) -> Result<ScanPass> {
        let pass = self.passes.fetch_add(1, Ordering::AcqRel);
        let mut stream = FFI_ArrowArrayStream::empty();
        // SAFETY: `open` and `user_data` were supplied together by the host,
        // and `stream` is a valid, empty out-parameter.
        let rc = unsafe { (self.open)(self.user_data.get(), &mut stream) };
        if rc != 0 {
            return Err(NativeError::Stream(format!(
                "scan source failed to open pass {pass} (code {rc})"
            )));
        }
        let reader = ArrowArrayStreamReader::try_new(stream)
            .map_err(|e| NativeError::Stream(format!("pass {pass}: {e}")))?;
        ensure_same_layout(&self.schema, &reader.schema(), &format!("scan pass {pass}"))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(pass, "scan pass opened");

        Ok(ScanPass {
            scan: Arc::clone(self),
            reader: Some(reader),
            pass,
            batches: 0,
        })
    }
}

impl fmt::Debug for StreamScan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamScan")
            .field("schema", &self.schema)
            .field("passes", &self.passes())
            .finish_non_exhaustive()
    }
}

impl Drop for StreamScan {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            #[cfg(feature = "tracing")]
            tracing::debug!(passes = self.passes(), "scan released");
            // SAFETY: called once, with the pointer the host handed over.
            unsafe { release(self.user_data.get()) };
        }
    }
}

struct ReleaseGuard {
    release: Option<ReleaseUserDataCallback>,
    user_data: SendPtr,
}

impl ReleaseGuard {
    fn disarm(mut self) -> Option<ReleaseUserDataCallback> {
        self.release.take()
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            unsafe { release(self.user_data.get()) };
        }
    }
}

/// One pass over a scan. Fused after the first error or end of stream; the
/// underlying C stream is released when the pass is dropped.
pub(crate) struct ScanPass {
    scan: Arc<StreamScan>,
    reader: Option<ArrowArrayStreamReader>,
    pass: usize,
    batches: usize,
}

impl Iterator for ScanPass {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        let item = match reader.next() {
            None => None,
            Some(Err(e)) => Some(Err(NativeError::Stream(format!(
                "pass {} batch {}: {e}",
                self.pass, self.batches
            )))),
            Some(Ok(batch)) => Some(
                ensure_same_layout(
                    &self.scan.schema,
                    batch.schema_ref(),
                    &format!("scan pass {} batch {}", self.pass, self.batches),
                )
                .map(|()| batch),
            ),
        };
        match &item {
            Some(Ok(_)) => self.batches += 1,
            _ => self.reader = None,
        }
        item
    }
}
