//! Per-kind allocation counters for every resource handed across the ABI.
//!
//! Cheap atomics only. Hosts and tests read them to prove that a consumed
//! pointer is freed once and a disposed handle is never freed twice.

use std::ffi::c_int;
use std::sync::atomic::{AtomicU64, Ordering};

use colbridge_core::ownership::ResourceKind;

const KINDS: usize = ResourceKind::ALL.len();

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU64 = AtomicU64::new(0);

static ALLOCATED: [AtomicU64; KINDS] = [ZERO; KINDS];
static FREED: [AtomicU64; KINDS] = [ZERO; KINDS];

fn slot(kind: ResourceKind) -> usize {
    kind.code() as usize
}

pub(crate) fn record_alloc(kind: ResourceKind) {
    ALLOCATED[slot(kind)].fetch_add(1, Ordering::AcqRel);
    #[cfg(feature = "tracing")]
    tracing::trace!(%kind, "alloc");
}

pub(crate) fn record_free(kind: ResourceKind) {
    FREED[slot(kind)].fetch_add(1, Ordering::AcqRel);
    #[cfg(feature = "tracing")]
    tracing::trace!(%kind, "free");
}

/// Snapshot of one kind's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindStats {
    pub allocated: u64,
    pub freed: u64,
}

impl KindStats {
    pub fn live(&self) -> i64 {
        self.allocated as i64 - self.freed as i64
    }
}

pub fn stats(kind: ResourceKind) -> KindStats {
    KindStats {
        allocated: ALLOCATED[slot(kind)].load(Ordering::Acquire),
        freed: FREED[slot(kind)].load(Ordering::Acquire),
    }
}

/// Live (allocated minus freed) resources of `kind`, or -1 for an unknown kind.
#[no_mangle]
pub extern "C" fn cb_resource_live_count(kind: c_int) -> i64 {
    ResourceKind::from_code(kind).map_or(-1, |k| stats(k).live())
}

/// Total frees recorded for `kind`, or -1 for an unknown kind.
#[no_mangle]
pub extern "C" fn cb_resource_freed_count(kind: c_int) -> i64 {
    ResourceKind::from_code(kind).map_or(-1, |k| stats(k).freed as i64)
}
