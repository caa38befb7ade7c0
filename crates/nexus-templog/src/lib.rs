//! # nexus-templog
//!
//! Deferred-action log ("temp log") for the Nexus BLOB engine.
//!
//! Every destructive BLOB state change is preceded by an append to this log:
//! a newly created BLOB, the release of a BLOB's last reference, or the drop
//! of a table. A background processor in the engine replays the log after the
//! grace period has elapsed, and again from the oldest segment after a
//! restart. Replay is idempotent because the engine only acts on a record
//! whose position still matches the deletion marker in the BLOB header.
//!
//! # Architecture
//!
//! The log is a sequence of segments `temp-XXXXXXXX.bs`. A new segment starts
//! once the active one exceeds the configured threshold; sealed segments are
//! deleted after all their records have been processed.
//!
//! ## Segment Format
//!
//! ```text
//! +-----------------------------------------------------------+
//! | Segment header (32): magic, version, sizes, flags, id     |
//! +-----------------------------------------------------------+
//! | Action record (32) | Action record (32) | ...             |
//! +-----------------------------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;

/// Record formats.
pub mod record;

/// Segment files.
pub mod segment;

/// Log manager.
pub mod log;

/// Sequential reader.
pub mod reader;

// Re-exports for convenience
pub use config::TempLogConfig;
pub use error::{TempLogError, TempLogResult};
pub use log::{TempLog, TempLogStats};
pub use reader::{LogEntry, TempLogReader};
pub use record::{ActionRecord, ActionType, LogPosition, SegmentFlags, SegmentHeader};
pub use segment::TempLogSegment;
