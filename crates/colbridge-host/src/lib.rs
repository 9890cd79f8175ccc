//! colbridge: safe host bindings for the colbridge native engine.
//!
//! - [`handle`]: ownership-tagged native pointers ([`ResourceHandle`]).
//! - [`resources`]: typed wrappers whose signatures encode each call's
//!   ownership edge (Borrow, Clone or Consume).
//! - [`schema_bridge`]: schema exchange over the Arrow C data interface.
//! - [`source`]: replayable scan sources for the engine's stream protocol.
//! - [`sink`]: direct and pull-adapted sinks over one push primitive.
//!
//! Every native call clears the engine's last-error slot before the call
//! and drains it right after, so a failure surfaces as [`BridgeError`] on
//! the call that caused it.

pub mod error;
pub mod handle;
pub mod metrics;
pub mod queue;
pub mod resources;
pub mod schema_bridge;
pub mod sink;
pub mod source;

pub use colbridge_core::config::BridgeConfig;
pub use colbridge_core::ownership::{JoinType, OwnershipEdge, ResourceKind};
pub use colbridge_core::schema::{DataType, Field, SchemaDescriptor, TimeUnit};

pub use error::{native_call, BridgeError, Result};
pub use handle::{dispose_all, Disposable, NativeResource, ResourceHandle};
pub use queue::BoundedBatchQueue;
pub use resources::{Column, DataTypeHandle, Expr, Frame, Plan, SchemaHandle, Selector};
pub use sink::{PullCursor, SinkOptions};
pub use source::{BatchReader, ScanSource, ScanStats};

/// Common imports for building and running plans.
pub mod prelude {
    pub use crate::{
        BridgeConfig, BridgeError, Column, Disposable, Expr, Frame, JoinType, Plan, PullCursor,
        Result, ScanSource, SchemaDescriptor, Selector, SinkOptions,
    };
}
