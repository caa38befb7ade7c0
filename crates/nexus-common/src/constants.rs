//! System-wide constants for the Nexus BLOB engine.
//!
//! On-disk magic numbers, format versions and configuration defaults live
//! here so every crate agrees on them.

// =============================================================================
// Repository Files
// =============================================================================

/// Magic number at the start of every repository file ("NXBR").
pub const REPO_MAGIC: u32 = 0x4E58_4252;

/// Repository file format version.
pub const REPO_VERSION: u16 = 1;

/// Size of the repository file header in bytes.
pub const REPO_HEADER_SIZE: usize = 64;

/// Magic number at the start of every BLOB record ("NXBL").
pub const BLOB_MAGIC: u32 = 0x4E58_424C;

/// Size of one reference slot in a BLOB record header.
pub const REF_SLOT_SIZE: usize = 16;

/// Default repository file size threshold (128 MB).
///
/// A repository that has grown past this size is not chosen for new records.
pub const DEFAULT_REPOSITORY_THRESHOLD: u64 = 128 * 1024 * 1024;

/// Default garbage percentage at which a repository becomes eligible for
/// compaction.
pub const DEFAULT_GARBAGE_THRESHOLD: u8 = 50;

/// Default number of reference slots reserved in a new record header.
pub const DEFAULT_REF_SLOTS: u16 = 4;

/// Number of per-offset lock buckets in each repository.
pub const OFFSET_LOCK_COUNT: usize = 31;

/// Buffer size used when copying record payloads.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

// =============================================================================
// Table Indirection Files
// =============================================================================

/// Magic number of a table indirection file ("NXBT").
pub const TABLE_MAGIC: u32 = 0x4E58_4254;

/// Table indirection file format version.
pub const TABLE_VERSION: u16 = 1;

/// Size of the table indirection file header.
pub const TABLE_HEADER_SIZE: usize = 32;

/// Size of one indirection slot.
pub const TABLE_SLOT_SIZE: usize = 32;

/// Largest BLOB id that fits the 48-bit id space.
pub const MAX_BLOB_ID: u64 = (1 << 48) - 1;

// =============================================================================
// Deferred-Action Log
// =============================================================================

/// Magic number of a temp log segment ("NXTL").
pub const TEMP_LOG_MAGIC: u32 = 0x4E58_544C;

/// Temp log format version.
pub const TEMP_LOG_VERSION: u16 = 1;

/// Default temp log segment threshold (32 MB).
pub const DEFAULT_TEMP_LOG_THRESHOLD: u64 = 32 * 1024 * 1024;

/// Default grace period before an unreferenced BLOB is deleted (10 minutes).
pub const DEFAULT_TEMP_BLOB_TIMEOUT_SECS: u64 = 10 * 60;

// =============================================================================
// Background Tasks
// =============================================================================

/// Default compactor poll interval in milliseconds.
pub const DEFAULT_COMPACTOR_POLL_MS: u64 = 3000;

/// Default number of repository file handles kept open per database.
pub const DEFAULT_MAX_OPEN_FILES: usize = 64;

// =============================================================================
// Backup
// =============================================================================

/// Magic number of a backup dump stream ("NXBD").
pub const DUMP_MAGIC: u32 = 0x4E58_4244;

/// Backup dump format version.
pub const DUMP_VERSION: u16 = 1;

/// Name of the dump file inside a backup destination directory.
pub const DUMP_FILE_NAME: &str = "blobs.dump";

/// Suffix given to the destination directory of a terminated backup.
pub const TERMINATED_SUFFIX: &str = ".terminated";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magics_are_distinct() {
        let magics = [REPO_MAGIC, BLOB_MAGIC, TABLE_MAGIC, TEMP_LOG_MAGIC, DUMP_MAGIC];
        for (i, a) in magics.iter().enumerate() {
            for b in &magics[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_blob_id_space() {
        assert_eq!(MAX_BLOB_ID, 0x0000_FFFF_FFFF_FFFF);
    }
}
