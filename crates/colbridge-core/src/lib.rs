#![forbid(unsafe_code)]
//! colbridge-core: pure data shared by the native engine shim and the host bridge.
//!
//! Nothing here touches raw pointers or Arrow. The native crate and the host
//! crate both depend on these definitions so that resource kinds, join codes
//! and ownership edges agree on both sides of the C boundary.

pub mod config;
pub mod error;
pub mod ownership;
pub mod prelude;
pub mod schema;

pub use error::{Error, Result};
