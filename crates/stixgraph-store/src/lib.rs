//! # stixgraph store
//!
//! Per-report object store, extension tracking, bundle export and
//! benign-baseline filtering.

pub mod benign;
pub mod bundle;
pub mod error;
pub mod extensions;
pub mod store;

pub use benign::*;
pub use bundle::*;
pub use error::*;
pub use extensions::*;
pub use store::*;
