//! Host batch sources behind the engine's scan-stream protocol.
//!
//! A [`ScanSource`] wraps a factory that yields a fresh reader per call.
//! Every pass the engine opens gets its own [`PassReader`], which calls the
//! factory lazily on its first pull, so a self-join reads the source twice
//! without the host having to buffer it. Readers are closed when their pass
//! ends, fails or is dropped.
//!
//! The factory and readers run on the engine thread. Errors and panics are
//! caught there and handed to the engine as a stream error, which aborts the
//! query. The typed error is parked on the source under a fault number that
//! rides along in the stream error text, so the execution that failed takes
//! back exactly its own error even while clones of the plan run elsewhere.

use std::ffi::{c_int, c_void};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arrow::array::{RecordBatch, RecordBatchIterator, RecordBatchReader};
use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use arrow::ffi_stream::FFI_ArrowArrayStream;
use colbridge_core::config::BridgeConfig;
use colbridge_core::schema::SchemaDescriptor;
use colbridge_native::plan;

use crate::error::{panic_message, BridgeError, Result};
use crate::handle::ResourceHandle;
use crate::metrics;
use crate::resources::{Plan, SchemaHandle};
use crate::schema_bridge;

pub type BatchReader = Box<dyn RecordBatchReader + Send>;

type Factory = Arc<dyn Fn() -> Result<BatchReader> + Send + Sync>;

/// Counters shared between a source and every pass opened over it.
#[derive(Debug, Default)]
pub struct ScanStats {
    factory_calls: AtomicUsize,
    passes: AtomicUsize,
    readers_closed: AtomicUsize,
    releases: AtomicUsize,
}

impl ScanStats {
    /// Times the factory was invoked, schema probing included.
    pub fn factory_calls(&self) -> usize {
        self.factory_calls.load(Ordering::Acquire)
    }

    pub fn passes(&self) -> usize {
        self.passes.load(Ordering::Acquire)
    }

    pub fn readers_closed(&self) -> usize {
        self.readers_closed.load(Ordering::Acquire)
    }

    /// Times the engine released the source; at most one.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::Acquire)
    }
}

pub struct ScanSource {
    factory: Factory,
    schema: Option<SchemaRef>,
    stats: Arc<ScanStats>,
}

impl ScanSource {
    /// Replayable source from a reader factory.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<BatchReader> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            schema: None,
            stats: Arc::new(ScanStats::default()),
        }
    }

    /// In-memory source; every pass replays the same batches.
    pub fn from_batches(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        let reader_schema = schema.clone();
        Self::new(move || {
            let reader =
                RecordBatchIterator::new(batches.clone().into_iter().map(Ok), reader_schema.clone());
            Ok(Box::new(reader) as BatchReader)
        })
        .with_arrow_schema(schema)
    }

    /// Source from a function producing a fresh batch iterator per pass.
    pub fn from_iter_factory<F, I>(schema: SchemaRef, f: F) -> Self
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: IntoIterator<Item = Result<RecordBatch>>,
        I::IntoIter: Send + 'static,
    {
        let reader_schema = schema.clone();
        Self::new(move || {
            let batches = f().into_iter().map(|r| r.map_err(BridgeError::into_arrow));
            Ok(Box::new(RecordBatchIterator::new(batches, reader_schema.clone())) as BatchReader)
        })
        .with_arrow_schema(schema)
    }

    /// Single-use source over an existing reader. The schema comes from the
    /// reader without pulling; a second pass fails.
    pub fn once(reader: BatchReader) -> Self {
        let schema = reader.schema();
        let slot = Mutex::new(Some(reader));
        Self::new(move || {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or_else(|| {
                    BridgeError::Source("single-use scan source was already consumed".into())
                })
        })
        .with_arrow_schema(schema)
    }

    pub fn with_schema(self, desc: &SchemaDescriptor) -> Result<Self> {
        Ok(self.with_arrow_schema(schema_bridge::to_arrow_schema(desc)?))
    }

    pub fn with_arrow_schema(mut self, schema: SchemaRef) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn stats(&self) -> Arc<ScanStats> {
        Arc::clone(&self.stats)
    }

    /// The declared schema, or one probed from a reader that is dropped
    /// before anything is pulled from it.
    pub fn resolve_schema(&self, config: &BridgeConfig) -> Result<SchemaRef> {
        if let Some(schema) = &self.schema {
            return Ok(schema.clone());
        }
        if !config.probe_schema {
            return Err(BridgeError::Schema(
                "scan source has no schema and probing is disabled".into(),
            ));
        }
        self.stats.factory_calls.fetch_add(1, Ordering::AcqRel);
        let probe = catch_unwind(AssertUnwindSafe(|| (self.factory)()))
            .map_err(|p| BridgeError::Source(format!("schema probe panicked: {}", panic_message(&*p))))??;
        let schema = probe.schema();
        drop(probe);
        #[cfg(feature = "tracing")]
        tracing::debug!(fields = schema.fields().len(), "probed scan schema");
        Ok(schema)
    }
}

impl fmt::Debug for ScanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanSource")
            .field("schema", &self.schema)
            .field("stats", &self.stats)
            .finish()
    }
}

/// State reachable from the engine through `user_data`.
pub(crate) struct SourceShared {
    factory: Factory,
    schema: SchemaRef,
    stats: Arc<ScanStats>,
    faults: Mutex<HashMap<u64, BridgeError>>,
}

impl SourceShared {
    /// Park `e` until the failing execution claims it.
    fn record_fault(&self, e: &BridgeError) -> u64 {
        static NEXT_FAULT: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_FAULT.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %e, fault = id, "scan source fault");
        self.lock_faults().insert(id, e.clone());
        id
    }

    fn take_fault(&self, id: u64) -> Option<BridgeError> {
        self.lock_faults().remove(&id)
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, HashMap<u64, BridgeError>> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn parked_faults(&self) -> usize {
        self.lock_faults().len()
    }
}

impl fmt::Debug for SourceShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceShared")
            .field("fields", &self.schema.fields().len())
            .field("stats", &self.stats)
            .finish()
    }
}

const FAULT_TAG: &str = "[scan fault #";

/// A pass error as it crosses the C stream. The tag survives the engine's
/// message wrapping.
#[derive(Debug)]
struct PassFault {
    id: u64,
    error: BridgeError,
}

impl fmt::Display for PassFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {FAULT_TAG}{}]", self.error, self.id)
    }
}

impl std::error::Error for PassFault {}

/// Fault numbers tagged into an engine error message, in order.
fn fault_ids(message: &str) -> Vec<u64> {
    message
        .match_indices(FAULT_TAG)
        .filter_map(|(at, _)| {
            let rest = &message[at + FAULT_TAG.len()..];
            rest[..rest.find(']')?].parse().ok()
        })
        .collect()
}

/// The source error behind a failed execution over `sources`, if the engine
/// error names one. Every fault it names is taken off its source.
pub(crate) fn claim_fault(sources: &[Arc<SourceShared>], err: &BridgeError) -> Option<BridgeError> {
    let BridgeError::Native(message) = err else {
        return None;
    };
    let mut first = None;
    for id in fault_ids(message) {
        if let Some(fault) = sources.iter().find_map(|s| s.take_fault(id)) {
            first.get_or_insert(fault);
        }
    }
    first
}

impl Plan {
    /// Scan `source` with the default configuration.
    pub fn scan(source: ScanSource) -> Result<Plan> {
        Self::scan_with(source, &BridgeConfig::default())
    }

    pub fn scan_with(source: ScanSource, config: &BridgeConfig) -> Result<Plan> {
        let schema = source.resolve_schema(config)?;
        let schema_handle = SchemaHandle::from_arrow(&schema)?;
        let schema_ptr = schema_handle.handle().borrow_ptr()?;
        let shared = Arc::new(SourceShared {
            factory: source.factory,
            schema,
            stats: source.stats,
            faults: Mutex::new(HashMap::new()),
        });
        // Released by `release_trampoline`, also when the call below fails.
        let user_data = Arc::into_raw(Arc::clone(&shared)) as *mut c_void;
        let handle = ResourceHandle::from_native(|| unsafe {
            plan::cb_plan_scan_stream(
                schema_ptr,
                Some(open_trampoline),
                Some(release_trampoline),
                user_data,
            )
        })?;
        Ok(Plan::from_parts(handle, vec![shared]))
    }
}

unsafe extern "C" fn open_trampoline(user_data: *mut c_void, out: *mut FFI_ArrowArrayStream) -> c_int {
    let raw = user_data as *const SourceShared;
    // SAFETY: `user_data` is the Arc leaked in `scan_with`; the engine keeps
    // it alive until `release_trampoline`. We take one more reference for
    // the pass.
    let shared = unsafe {
        Arc::increment_strong_count(raw);
        Arc::from_raw(raw)
    };
    if out.is_null() {
        return 1;
    }
    let pass = shared.stats.passes.fetch_add(1, Ordering::AcqRel);
    metrics::global().record_pass();
    #[cfg(feature = "tracing")]
    tracing::debug!(pass, "opening scan pass");
    let reader = PassReader {
        shared,
        state: PassState::Pending,
        pass,
    };
    // SAFETY: `out` is a writable, empty stream struct owned by the engine.
    unsafe { std::ptr::write(out, FFI_ArrowArrayStream::new(Box::new(reader))) };
    0
}

unsafe extern "C" fn release_trampoline(user_data: *mut c_void) {
    // SAFETY: called exactly once by the engine for the Arc leaked in
    // `scan_with`.
    let shared = unsafe { Arc::from_raw(user_data as *const SourceShared) };
    shared.stats.releases.fetch_add(1, Ordering::AcqRel);
}

enum PassState {
    Pending,
    Active(BatchReader),
    Exhausted,
    Faulted,
}

/// One pass over a source, as the engine sees it through a C stream.
pub(crate) struct PassReader {
    shared: Arc<SourceShared>,
    state: PassState,
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    pass: usize,
}

impl PassReader {
    fn advance(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            match &mut self.state {
                PassState::Pending => {
                    self.shared.stats.factory_calls.fetch_add(1, Ordering::AcqRel);
                    let reader = (self.shared.factory)()?;
                    let declared = reader.schema();
                    // Active before the check, so a rejected reader is still closed.
                    self.state = PassState::Active(reader);
                    schema_bridge::ensure_same_layout(&self.shared.schema, &declared)?;
                }
                PassState::Active(reader) => {
                    return match reader.next() {
                        None => Ok(None),
                        Some(Err(e)) => Err(BridgeError::from_arrow(e)),
                        Some(Ok(batch)) => {
                            schema_bridge::ensure_same_layout(&self.shared.schema, batch.schema_ref())?;
                            schema_bridge::rebind(&batch, &self.shared.schema).map(Some)
                        }
                    };
                }
                PassState::Exhausted | PassState::Faulted => return Ok(None),
            }
        }
    }

    /// Move to a terminal state, closing the reader if one is open.
    fn settle(&mut self, next: PassState) {
        if let PassState::Active(reader) = std::mem::replace(&mut self.state, next) {
            drop(reader);
            self.shared.stats.readers_closed.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Iterator for PassReader {
    type Item = std::result::Result<RecordBatch, ArrowError>;

    fn next(&mut self) -> Option<Self::Item> {
        let step = catch_unwind(AssertUnwindSafe(|| self.advance())).unwrap_or_else(|p| {
            Err(BridgeError::Source(format!(
                "scan source panicked: {}",
                panic_message(&*p)
            )))
        });
        match step {
            Ok(Some(batch)) => {
                metrics::global().record_pull();
                Some(Ok(batch))
            }
            Ok(None) => {
                self.settle(PassState::Exhausted);
                None
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(pass = self.pass, "scan pass failed");
                self.settle(PassState::Faulted);
                let id = self.shared.record_fault(&e);
                Some(Err(ArrowError::ExternalError(Box::new(PassFault { id, error: e }))))
            }
        }
    }
}

impl RecordBatchReader for PassReader {
    fn schema(&self) -> SchemaRef {
        self.shared.schema.clone()
    }
}

impl Drop for PassReader {
    fn drop(&mut self) {
        self.settle(PassState::Exhausted);
    }
}
