//! # stixgraph CLI
//!
//! Command-line front end for the CAPE to STIX converter: batch
//! conversion and inspection of the benign reference corpus.

pub mod commands;

pub use commands::*;
