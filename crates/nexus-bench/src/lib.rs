//! nexus BLOB engine benchmarks
//!
//! Benchmarks for:
//! - BLOB creation across payload sizes
//! - Whole and ranged reads
//! - Reference and dereference churn
//! - Compaction of a garbage-heavy repository
//!
//! Run benchmarks with:
//! ```bash
//! cargo bench -p nexus-bench
//! ```

pub mod utils;
