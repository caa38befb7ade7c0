//! On-disk BLOB record format.
//!
//! A record is a header followed by the payload. The header has a fixed part
//! and a variable region shared by reference slots and the metadata block.

mod header;
mod metadata;
mod slots;

pub use header::{BlobFlags, BlobHeader, BlobStatus, FixedHeader, Growth, MIN_HEAD_SIZE};
pub use metadata::{alias_hash, Metadata, ALIAS_KEY};
pub use slots::{RefSlot, MAX_TABLE_INDEX};

/// Computes the content digest of a payload.
pub fn digest(payload: &[u8]) -> [u8; 16] {
    use md5::{Digest, Md5};
    Md5::digest(payload).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_known_value() {
        // MD5("abc")
        assert_eq!(
            digest(b"abc"),
            [
                0x90, 0x01, 0x50, 0x98, 0x3c, 0xd2, 0x4f, 0xb0, 0xd6, 0x96, 0x3f, 0x7d, 0x28, 0xe1,
                0x7f, 0x72
            ]
        );
    }
}
