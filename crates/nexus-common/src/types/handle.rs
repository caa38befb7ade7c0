//! Externally visible BLOB handles.
//!
//! A handle is what the host database stores in a row. Its text form is
//!
//! ```text
//! ~*<db_id>~<table_id>-<blob_id>-<auth_code_hex>-<size>
//! ```
//!
//! The handle stays valid for the BLOB's whole physical lifetime because it
//! names the per-table BLOB id, not a repository offset.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{AuthCode, BlobId, DatabaseId, TableId};
use crate::error::BlobError;

const HANDLE_PREFIX: &str = "~*";

/// Opaque identifier of one BLOB as seen through one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobHandle {
    /// Owning database.
    pub db_id: DatabaseId,
    /// Table the BLOB id belongs to.
    pub table_id: TableId,
    /// Per-table BLOB id.
    pub blob_id: BlobId,
    /// Capability value checked against the record header.
    pub auth_code: AuthCode,
    /// Logical BLOB size in bytes.
    pub size: u64,
}

impl BlobHandle {
    /// Creates a new handle.
    #[must_use]
    pub const fn new(
        db_id: DatabaseId,
        table_id: TableId,
        blob_id: BlobId,
        auth_code: AuthCode,
        size: u64,
    ) -> Self {
        Self {
            db_id,
            table_id,
            blob_id,
            auth_code,
            size,
        }
    }

    /// Returns true if the string looks like a handle.
    #[must_use]
    pub fn could_be_handle(s: &str) -> bool {
        s.starts_with(HANDLE_PREFIX) && s.parse::<Self>().is_ok()
    }
}

impl fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}~{}-{}-{}-{}",
            HANDLE_PREFIX, self.db_id, self.table_id, self.blob_id, self.auth_code, self.size
        )
    }
}

impl FromStr for BlobHandle {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || BlobError::invalid_argument(format!("malformed BLOB handle: {s:?}"));

        let rest = s.strip_prefix(HANDLE_PREFIX).ok_or_else(bad)?;
        let (db, rest) = rest.split_once('~').ok_or_else(bad)?;
        let mut parts = rest.split('-');
        let table = parts.next().ok_or_else(bad)?;
        let blob = parts.next().ok_or_else(bad)?;
        let auth = parts.next().ok_or_else(bad)?;
        let size = parts.next().ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }

        let db_id = db.parse::<u32>().map_err(|_| bad())?;
        let table_id = table.parse::<u32>().map_err(|_| bad())?;
        let blob_id = blob.parse::<u64>().map_err(|_| bad())?;
        let auth_code = u32::from_str_radix(auth, 16).map_err(|_| bad())?;
        let size = size.parse::<u64>().map_err(|_| bad())?;

        let blob_id = BlobId::new(blob_id);
        if !blob_id.is_valid() {
            return Err(bad());
        }

        Ok(Self::new(
            DatabaseId::new(db_id),
            TableId::new(table_id),
            blob_id,
            AuthCode::new(auth_code),
            size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlobHandle {
        BlobHandle::new(
            DatabaseId::new(2),
            TableId::new(5),
            BlobId::new(17),
            AuthCode::new(0xdead_beef),
            1000,
        )
    }

    #[test]
    fn test_display_format() {
        assert_eq!(sample().to_string(), "~*2~5-17-deadbeef-1000");
    }

    #[test]
    fn test_parse() {
        let parsed: BlobHandle = "~*2~5-17-deadbeef-1000".parse().unwrap();
        assert_eq!(parsed, sample());
        assert!(BlobHandle::could_be_handle("~*2~5-17-deadbeef-1000"));
    }

    #[test]
    fn test_parse_rejects_junk() {
        for s in [
            "",
            "2~5-17-deadbeef-1000",
            "~*2~5-17-deadbeef",
            "~*2~5-17-deadbeef-1000-9",
            "~*2~5-0-deadbeef-1000",
            "~*x~5-17-deadbeef-1000",
            "~*2~5-17-nothex-1000",
        ] {
            assert!(s.parse::<BlobHandle>().is_err(), "accepted {s:?}");
        }
    }
}
