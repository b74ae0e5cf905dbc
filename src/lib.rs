//! Weft – an embeddable runtime for durable, suspendable activity trees
//!
//! This crate provides:
//! - An arena model of workflow definitions, with shared subtrees, imported
//!   references and private implementation id-spaces
//! - Validation services: a structural caching pass plus pluggable
//!   constraints dispatched along a precomputed type hierarchy, with precise
//!   attribution of errors raised inside hidden implementations
//! - A workflow instance controller that serializes host operations with a
//!   fail-fast operation lock, manages bookmark suspension, abort and
//!   terminate, and emits lifecycle tracking
//! - A file-backed instance store and a small CLI

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core modules
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{Runtime, RuntimeConfig};

/// Current version of the weft runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
