//! Convenient re-exports for downstream crates.

pub use crate::config::BridgeConfig;
pub use crate::error::{Error, Result};
pub use crate::ownership::{JoinType, OwnershipEdge, ResourceKind};
pub use crate::schema::{DataType, Field, SchemaDescriptor, TimeUnit};
