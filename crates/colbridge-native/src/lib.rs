//! colbridge-native: a small columnar engine behind a C ABI.
//!
//! Every resource (plan, frame, column, expression, schema, selector, type
//! descriptor) is an opaque boxed context. Each kind has a null-tolerant
//! `cb_<kind>_free` and a `cb_<kind>_clone`; the ownership edge of every
//! other pointer argument is listed in `colbridge_core::ownership::EDGE_TABLE`.
//!
//! Failures never unwind: entry points return null or `-1` and leave a
//! message in the thread-local slot read by `cb_last_error_take`.
//!
//! Batches, schemas and streams cross the boundary as Arrow C data interface
//! structs (`FFI_ArrowArray`, `FFI_ArrowSchema`, `FFI_ArrowArrayStream`).

pub mod error;

pub mod column;
pub mod datatype;
pub mod exec;
pub mod expr;
pub mod frame;
pub mod plan;
pub mod scan;
pub mod schema;
pub mod selector;
pub mod tracking;
pub mod types;

pub use column::ColumnContext;
pub use datatype::DataTypeContext;
pub use error::{NativeError, Result};
pub use exec::{PushBatchCallback, ENGINE_THREAD_NAME};
pub use expr::{Expr, ExprContext};
pub use frame::FrameContext;
pub use plan::PlanContext;
pub use scan::{OpenStreamCallback, ReleaseUserDataCallback, StreamScan};
pub use schema::SchemaContext;
pub use selector::{Selector, SelectorContext};
pub use tracking::{stats, KindStats};
