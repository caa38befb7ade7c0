//! Deferred-action processing.
//!
//! The processor follows the temp log with a cursor. An action is applied
//! once its grace period has passed; applying it is idempotent because each
//! BLOB action only acts while the record still carries a deletion marker at
//! the action's log position, and a drop only acts while the table is still
//! marked for deletion.

use std::time::Duration;

use nexus_common::error::BlobResult;
use nexus_common::types::{TableId, Timestamp};
use nexus_templog::{ActionType, LogEntry, TempLogReader};

use crate::database::Database;
use crate::record::RefSlot;
use crate::stats::DatabaseStats;

/// Cursor state of a database's deferred-action processor.
#[derive(Debug)]
pub(crate) struct DeferredProcessor {
    reader: TempLogReader,
}

impl DeferredProcessor {
    pub(crate) fn new(reader: TempLogReader) -> Self {
        Self { reader }
    }

    /// Applies every due action. Returns how long until the next action
    /// becomes due, if one is waiting.
    pub(crate) fn run(&mut self, db: &Database) -> BlobResult<Option<Duration>> {
        let grace = db.config.temp_blob_timeout_secs;
        let mut next = None;
        loop {
            if db.processor_signal.is_stopped() {
                break;
            }
            let Some(entry) = self.reader.peek(&db.temp_log)? else {
                break;
            };
            let now = Timestamp::now();
            // Log times are whole seconds; round the deadline up so a full
            // grace period always elapses.
            let due = entry.record.due_at(grace + u64::from(grace > 0));
            if !due.has_passed(now) {
                next = Some(due.remaining(now));
                break;
            }
            match db.apply_action(&entry) {
                Ok(true) => DatabaseStats::inc(&db.stats.actions_applied),
                Ok(false) => DatabaseStats::inc(&db.stats.actions_skipped),
                Err(e) if e.is_corruption() || e.is_recoverable() => {
                    tracing::warn!(position = %entry.position, error = %e, "skipping deferred action");
                    DatabaseStats::inc(&db.stats.actions_skipped);
                }
                // Left unconsumed; retried on the next pass.
                Err(e) => return Err(e),
            }
            self.reader.consume();
        }

        for log_id in self.reader.finished_segments(&db.temp_log) {
            db.temp_log.remove_segment(log_id)?;
            tracing::debug!(db = %db.id, log_id, "removed processed temp log segment");
        }
        Ok(next)
    }
}

impl Database {
    /// Applies one deferred action. Returns false if it no longer applied.
    pub(crate) fn apply_action(&self, entry: &LogEntry) -> BlobResult<bool> {
        match entry.record.action {
            ActionType::TempBlob | ActionType::ReleaseBlob => self.check_blob(entry),
            ActionType::DropTable => self.reclaim_table(entry.record.table_id),
        }
    }

    /// Releases every BLOB reference held by a dropped table, then removes
    /// the table.
    fn reclaim_table(&self, table_id: TableId) -> BlobResult<bool> {
        if !self.tables.is_dropped(table_id) {
            return Ok(false);
        }
        let table = self.tables.indirection(table_id)?;
        let mut released = 0u64;
        for (blob_id, location) in table.entries()? {
            let repo = match self.repository(location.repo_id) {
                Ok(repo) => repo,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let _guard = repo.lock_record(location.offset);
            if !table.points_at(blob_id, repo.id(), location.offset)? {
                continue;
            }
            let mut header = repo.read_header(location.offset)?;
            if !header.status.is_live() {
                continue;
            }
            let Some(table_index) = header.table_ref_index(table_id) else {
                continue;
            };
            let shared = header
                .table_refs()
                .any(|(_, other, _)| other != table_id && self.tables.is_live(other));
            if shared {
                header.free_table_ref(table_index);
                if header.committed_ref_count() + header.uncommitted_ref_count() == 0 {
                    // A pending marker may name the dropped table; requeue
                    // through a surviving one.
                    if let Some((index, _, _)) = header.deletion_marker() {
                        header.set_slot(index, RefSlot::Free);
                    }
                    self.queue_deletion(&mut header)?;
                }
                header.mod_time = Timestamp::now();
                repo.write_header(location.offset, &header)?;
            } else {
                self.retire_record(&repo, location.offset, &mut header)?;
            }
            released += 1;
        }
        self.tables.purge(table_id)?;
        tracing::info!(db = %self.id, table = %table_id, released, "reclaimed dropped table");
        Ok(true)
    }
}
