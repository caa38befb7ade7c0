//! Reference transactions.
//!
//! A [`BlobTxn`] groups the reference changes of one host-database
//! transaction. New references are written immediately but tagged
//! uncommitted, so they keep the BLOB alive without counting as references.
//! Dereferences are checked immediately and applied at commit.

use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::{BlobHandle, RefId, TableId};

use crate::database::Database;
use crate::stats::DatabaseStats;

#[derive(Debug, Clone, Copy)]
struct RefChange {
    handle: BlobHandle,
    table_id: TableId,
    ref_id: RefId,
}

/// A group of reference changes committed or rolled back together.
///
/// Dropping an unfinished transaction rolls it back.
#[derive(Debug)]
pub struct BlobTxn<'a> {
    db: &'a Database,
    added: Vec<RefChange>,
    removed: Vec<RefChange>,
    finished: bool,
}

impl Database {
    /// Starts a reference transaction.
    pub fn begin(&self) -> BlobTxn<'_> {
        BlobTxn {
            db: self,
            added: Vec::new(),
            removed: Vec::new(),
            finished: false,
        }
    }
}

impl BlobTxn<'_> {
    /// References the BLOB from row `ref_id`, column `column` of `table_id`.
    ///
    /// Returns the BLOB's handle in `table_id`, which differs from `handle`
    /// when the BLOB was created through another table.
    pub fn reference(
        &mut self,
        handle: &BlobHandle,
        table_id: TableId,
        column: u16,
        ref_id: RefId,
    ) -> BlobResult<BlobHandle> {
        let referenced = self.db.add_reference(handle, table_id, column, ref_id)?;
        self.added.push(RefChange {
            handle: referenced,
            table_id,
            ref_id,
        });
        Ok(referenced)
    }

    /// Drops the reference from row `ref_id` of `table_id` at commit.
    ///
    /// Fails with NotFound if no such committed reference exists. A reference
    /// added earlier in this transaction is removed right away.
    pub fn dereference(&mut self, handle: &BlobHandle, table_id: TableId, ref_id: RefId) -> BlobResult<()> {
        if let Some(pos) = self
            .added
            .iter()
            .position(|c| c.table_id == table_id && c.ref_id == ref_id)
        {
            let change = self.added.remove(pos);
            return self.db.remove_reference(&change.handle, table_id, ref_id, true);
        }
        if self
            .removed
            .iter()
            .any(|c| c.table_id == table_id && c.ref_id == ref_id)
            || !self.db.has_reference(handle, table_id, ref_id)?
        {
            return Err(BlobError::not_found(format!(
                "reference {} from table {table_id}",
                ref_id.id()
            )));
        }
        self.removed.push(RefChange {
            handle: *handle,
            table_id,
            ref_id,
        });
        Ok(())
    }

    /// Makes the added references permanent and applies the dereferences.
    ///
    /// If committing an added reference fails, the ones not yet committed are
    /// rolled back when the transaction is dropped.
    pub fn commit(mut self) -> BlobResult<()> {
        while let Some(change) = self.added.first().copied() {
            self.db
                .commit_reference(&change.handle, change.table_id, change.ref_id)?;
            self.added.remove(0);
        }
        self.finished = true;
        for change in std::mem::take(&mut self.removed) {
            self.db
                .remove_reference(&change.handle, change.table_id, change.ref_id, false)?;
        }
        DatabaseStats::inc(&self.db.stats.commits);
        Ok(())
    }

    /// Discards the added references and the pending dereferences.
    pub fn rollback(mut self) -> BlobResult<()> {
        self.finished = true;
        self.undo()
    }

    fn undo(&mut self) -> BlobResult<()> {
        self.removed.clear();
        let mut first_error = None;
        for change in std::mem::take(&mut self.added) {
            if let Err(e) = self
                .db
                .remove_reference(&change.handle, change.table_id, change.ref_id, true)
            {
                tracing::warn!(handle = %change.handle, ref_id = change.ref_id.id(), error = %e, "failed to discard reference");
                first_error.get_or_insert(e);
            }
        }
        DatabaseStats::inc(&self.db.stats.rollbacks);
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for BlobTxn<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.undo();
        }
    }
}
