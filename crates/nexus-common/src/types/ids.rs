//! Core identifier types for the BLOB engine.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing a table id from being passed where a repository id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::MAX_BLOB_ID;

macro_rules! define_u32_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Invalid id, used as a sentinel value.
            pub const INVALID: Self = Self(0);

            /// Creates a new id from a raw value.
            #[inline]
            #[must_use]
            pub const fn new(id: u32) -> Self {
                Self(id)
            }

            /// Returns the raw value.
            #[inline]
            #[must_use]
            pub const fn as_u32(self) -> u32 {
                self.0
            }

            /// Returns the next id.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                Self(self.0.saturating_add(1))
            }

            /// Checks if this is a valid id.
            #[inline]
            #[must_use]
            pub const fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, "{}({})", stringify!($name), self.0)
                } else {
                    write!(f, "{}(INVALID)", stringify!($name))
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(id: u32) -> Self {
                Self::new(id)
            }
        }

        impl From<$name> for u32 {
            #[inline]
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_u32_id!(
    /// Database identifier, unique within one engine instance.
    DatabaseId
);

define_u32_id!(
    /// Table identifier, unique within one database.
    TableId
);

define_u32_id!(
    /// Repository file identifier, unique within one database.
    RepoId
);

define_u32_id!(
    /// Backup identifier, unique within one engine instance.
    BackupId
);

/// Per-table BLOB identifier.
///
/// BLOB ids are 48-bit values handed out by a table's indirection file. The
/// id never changes while the BLOB lives, even when compaction moves its
/// bytes to another repository.
///
/// # Example
///
/// ```rust
/// use nexus_common::types::BlobId;
///
/// let id = BlobId::new(7);
/// assert!(id.is_valid());
/// assert_eq!(id.slot_index(), 6);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BlobId(u64);

impl BlobId {
    /// Invalid BLOB id, used as a sentinel value.
    pub const INVALID: Self = Self(0);

    /// First valid BLOB id.
    pub const FIRST: Self = Self(1);

    /// Creates a new `BlobId`, truncated to 48 bits.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id & MAX_BLOB_ID)
    }

    /// Creates a `BlobId` from an indirection slot index.
    #[inline]
    #[must_use]
    pub const fn from_slot_index(index: u64) -> Self {
        Self::new(index + 1)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the indirection slot index for this id.
    #[inline]
    #[must_use]
    pub const fn slot_index(self) -> u64 {
        self.0.saturating_sub(1)
    }

    /// Checks if this is a valid BLOB id.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "BlobId({})", self.0)
        } else {
            write!(f, "BlobId(INVALID)")
        }
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlobId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

/// Row-level reference identifier supplied by the host database.
///
/// The top bit is reserved: while the owning transaction is open the id is
/// stored with [`RefId::UNCOMMITTED_FLAG`] set, which excludes it from
/// reference counts and from backups.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RefId(u64);

impl RefId {
    /// Flag marking a reference whose transaction has not committed.
    pub const UNCOMMITTED_FLAG: u64 = 0x8000_0000_0000_0000;

    /// Creates a new committed reference id. The reserved bit is cleared.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id & !Self::UNCOMMITTED_FLAG)
    }

    /// Creates a reference id from its stored form, keeping the flag bit.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the stored form, including the flag bit.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the id without the flag bit.
    #[inline]
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0 & !Self::UNCOMMITTED_FLAG
    }

    /// Returns this id tagged as uncommitted.
    #[inline]
    #[must_use]
    pub const fn uncommitted(self) -> Self {
        Self(self.0 | Self::UNCOMMITTED_FLAG)
    }

    /// Returns this id with the uncommitted tag cleared.
    #[inline]
    #[must_use]
    pub const fn committed(self) -> Self {
        Self(self.0 & !Self::UNCOMMITTED_FLAG)
    }

    /// Returns true if the id carries the uncommitted tag.
    #[inline]
    #[must_use]
    pub const fn is_uncommitted(self) -> bool {
        self.0 & Self::UNCOMMITTED_FLAG != 0
    }
}

impl fmt::Debug for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_uncommitted() {
            write!(f, "RefId({}, uncommitted)", self.id())
        } else {
            write!(f, "RefId({})", self.id())
        }
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Capability value embedded in a BLOB handle.
///
/// A read or reference is only honoured when the handle's auth code matches
/// the one stored in the record header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct AuthCode(u32);

impl AuthCode {
    /// Creates an auth code from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(code: u32) -> Self {
        Self(code)
    }

    /// Generates a random auth code.
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random::<u32>())
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for AuthCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthCode({:#010x})", self.0)
    }
}

impl fmt::Display for AuthCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
