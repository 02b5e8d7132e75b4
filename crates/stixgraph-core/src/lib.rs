//! # stixgraph core
//!
//! STIX 2.1 object model for sandbox analysis graphs: typed entities,
//! relationships, and the identity engine that makes them deduplicate.

pub mod error;
pub mod identity;
pub mod model;
pub mod relationship;
pub mod time;

pub use error::*;
pub use identity::*;
pub use model::*;
pub use relationship::*;
pub use time::*;
