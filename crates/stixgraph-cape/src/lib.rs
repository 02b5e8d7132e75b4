//! # stixgraph CAPE mapping
//!
//! Typed CAPE report model and the section mappers that turn it into
//! entities and edges: path trees, network aggregation, processes,
//! registry keys, mutexes, domains and ATT&CK techniques.

pub mod enrichment;
pub mod error;
pub mod mappers;
pub mod network;
pub mod paths;
pub mod report;

pub use enrichment::*;
pub use error::*;
pub use mappers::*;
pub use network::{collapse, map_hosts, map_traffic, Ipv4Block, Protocol};
pub use paths::{build_tree, PathTree, PathTreeBuilder};
pub use report::*;
