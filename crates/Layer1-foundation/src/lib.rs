//! # overseer-foundation
//!
//! Foundation layer for overseer:
//! - Error: the shared `Error`/`Result` types and the error collector
//! - Context: cancellation tokens with deadlines, threaded into executors
//! - Hash: stable hashing helpers for process specifications

pub mod context;
pub mod error;
pub mod hash;

pub use context::Context;
pub use error::{Error, ErrorCollector, Result};
pub use hash::{compute_hash, sorted_pairs, SectionHasher};
