//! # stixgraph engine
//!
//! Conversion pipeline for CAPE reports: per-document stage sequencing,
//! enrichment lookups with bounded timeouts, and batch orchestration
//! under a concurrency limit.

pub mod batch;
pub mod config;
pub mod error;
pub mod lookup;
pub mod pipeline;

pub use batch::*;
pub use config::*;
pub use error::*;
pub use lookup::*;
pub use pipeline::*;
