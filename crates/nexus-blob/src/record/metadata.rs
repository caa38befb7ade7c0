//! BLOB metadata block.
//!
//! Metadata is a list of name/value pairs encoded as `name\0value\0`. The
//! alias, when set, is stored as the first pair under a reserved name so the
//! alias survives in the record header itself.

use bytes::BufMut;

use nexus_common::error::{BlobError, BlobResult};

/// Reserved metadata name holding the alias.
pub const ALIAS_KEY: &str = "$alias";

/// Name/value pairs attached to a BLOB.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    alias: Option<String>,
    pairs: Vec<(String, String)>,
}

impl Metadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Metadata::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> BlobResult<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Builder form of [`Metadata::set_alias`].
    pub fn with_alias(mut self, alias: impl Into<String>) -> BlobResult<Self> {
        self.set_alias(alias)?;
        Ok(self)
    }

    fn check_text(what: &str, text: &str) -> BlobResult<()> {
        if text.contains('\0') {
            return Err(BlobError::invalid_argument(format!(
                "metadata {what} must not contain NUL"
            )));
        }
        Ok(())
    }

    /// Sets a value, replacing an existing pair with the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> BlobResult<()> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() || name == ALIAS_KEY {
            return Err(BlobError::invalid_argument(format!(
                "invalid metadata name {name:?}"
            )));
        }
        Self::check_text("name", &name)?;
        Self::check_text("value", &value)?;

        match self.pairs.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.pairs.push((name, value)),
        }
        Ok(())
    }

    /// Returns the value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Removes a pair, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.pairs.iter().position(|(n, _)| n == name)?;
        Some(self.pairs.remove(idx).1)
    }

    /// Iterates over the pairs, excluding the alias.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Returns the number of pairs, excluding the alias.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Returns true if there are no pairs and no alias.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty() && self.alias.is_none()
    }

    /// Returns the alias.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Sets the alias.
    pub fn set_alias(&mut self, alias: impl Into<String>) -> BlobResult<()> {
        let alias = alias.into();
        if alias.is_empty() {
            return Err(BlobError::invalid_argument("alias must not be empty"));
        }
        Self::check_text("alias", &alias)?;
        self.alias = Some(alias);
        Ok(())
    }

    /// Clears the alias, returning the old one.
    pub fn clear_alias(&mut self) -> Option<String> {
        self.alias.take()
    }

    /// Returns the encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        let alias = self
            .alias
            .as_ref()
            .map_or(0, |a| ALIAS_KEY.len() + a.len() + 2);
        alias
            + self
                .pairs
                .iter()
                .map(|(n, v)| n.len() + v.len() + 2)
                .sum::<usize>()
    }

    /// Serializes the block.
    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut put = |name: &str, value: &str| {
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
        };
        if let Some(alias) = &self.alias {
            put(ALIAS_KEY, alias);
        }
        for (name, value) in &self.pairs {
            put(name, value);
        }
    }

    /// Deserializes a block.
    pub fn decode(bytes: &[u8]) -> BlobResult<Self> {
        let mut metadata = Self::new();
        let mut fields = bytes.split(|b| *b == 0);
        let text = |raw: &[u8]| {
            std::str::from_utf8(raw)
                .map(str::to_owned)
                .map_err(|_| BlobError::corruption("metadata is not valid UTF-8"))
        };

        if !bytes.is_empty() && bytes[bytes.len() - 1] != 0 {
            return Err(BlobError::corruption("metadata block is not terminated"));
        }
        if bytes.iter().filter(|b| **b == 0).count() % 2 != 0 {
            return Err(BlobError::corruption("metadata name without value"));
        }

        loop {
            let name = match fields.next() {
                Some(n) if !n.is_empty() => text(n)?,
                // The split yields one empty tail after the final NUL.
                _ => break,
            };
            let value = fields
                .next()
                .ok_or_else(|| BlobError::corruption("metadata name without value"))?;
            let value = text(value)?;
            if name == ALIAS_KEY {
                metadata.alias = Some(value);
            } else {
                metadata.pairs.push((name, value));
            }
        }
        Ok(metadata)
    }
}

/// Hash of an alias, stored in the record header so scans can skip
/// decoding metadata of records without one.
pub fn alias_hash(alias: &str) -> u32 {
    crc32fast::hash(alias.as_bytes())
}
