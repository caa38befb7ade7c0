//! Online backup and restore.
//!
//! A backup takes a cut of a database (its repositories and their end
//! offsets) while the background workers are suspended, marks every
//! repository as backing up, then copies each committed record into
//! `<destination>/blobs.dump` on its own thread. While a repository is
//! backing up, records that die are marked Moved instead of Deleted and
//! compacted files are kept until the backup ends.

mod dump;
mod restore;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use nexus_common::config::StorageType;
use nexus_common::constants::{DUMP_FILE_NAME, TERMINATED_SUFFIX};
use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::{BackupId, DatabaseId, Timestamp};

use crate::database::Database;
use crate::meta;
use crate::reader::{BlobReader, ReaderSource};
use crate::record::BlobStatus;
use crate::repository::{RepoHeader, RepoStateGuard};
use crate::table::TableEntry;

pub use dump::DumpManifest;
pub use restore::RestoreSummary;
pub(crate) use restore::restore_into;

use dump::{DumpWriter, FrameKind};

const BACKUPS_FILE: &str = "backups.meta";
const BACKUPS_MAGIC: u32 = 0x4E58_424B;

/// Outcome of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupState {
    /// Still copying.
    Running,
    /// Dump written completely.
    Completed,
    /// Stopped by an error.
    Failed,
    /// Stopped on request.
    Terminated,
}

/// Persistent record of one backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    /// Backup id.
    pub id: BackupId,
    /// Source database name.
    pub db_name: String,
    /// Source database id.
    pub db_id: DatabaseId,
    /// Directory holding the dump.
    pub destination: PathBuf,
    /// Current state.
    pub state: BackupState,
    /// Start time.
    pub started: Timestamp,
    /// End time, once finished.
    pub finished: Option<Timestamp>,
    /// Records written.
    pub blobs: u64,
    /// Dump size.
    pub bytes: u64,
    /// Failure reason.
    pub error: Option<String>,
}

/// Progress of a running or finished backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackupStatus {
    /// Backup id.
    pub id: BackupId,
    /// Repository bytes covered by the cut.
    pub bytes_total: u64,
    /// Repository bytes processed so far.
    pub bytes_done: u64,
    /// True while the copy thread runs.
    pub running: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackupLedger {
    next_id: u32,
    descriptors: BTreeMap<BackupId, BackupDescriptor>,
}

/// Engine-wide list of backups, persisted in `backups.meta`.
#[derive(Debug)]
pub struct BackupManager {
    path: PathBuf,
    ledger: Mutex<BackupLedger>,
}

impl BackupManager {
    /// Loads the ledger. Backups left running by a crash are marked failed.
    pub fn open(data_dir: &Path) -> BlobResult<Self> {
        let path = data_dir.join(BACKUPS_FILE);
        let mut ledger = meta::load::<BackupLedger>(&path, BACKUPS_MAGIC)?.unwrap_or_default();
        let mut interrupted = 0;
        for descriptor in ledger.descriptors.values_mut() {
            if descriptor.state == BackupState::Running {
                descriptor.state = BackupState::Failed;
                descriptor.error = Some("interrupted by shutdown".into());
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            tracing::warn!(interrupted, "marked interrupted backups as failed");
            meta::save(&path, BACKUPS_MAGIC, &ledger)?;
        }
        Ok(Self {
            path,
            ledger: Mutex::new(ledger),
        })
    }

    fn register(&self, db: &Database, destination: &Path) -> BlobResult<BackupId> {
        let mut ledger = self.ledger.lock();
        ledger.next_id = ledger.next_id.max(1);
        let id = BackupId::new(ledger.next_id);
        ledger.next_id += 1;
        ledger.descriptors.insert(
            id,
            BackupDescriptor {
                id,
                db_name: db.name().to_string(),
                db_id: db.id(),
                destination: destination.to_path_buf(),
                state: BackupState::Running,
                started: Timestamp::now(),
                finished: None,
                blobs: 0,
                bytes: 0,
                error: None,
            },
        );
        meta::save(&self.path, BACKUPS_MAGIC, &*ledger)?;
        Ok(id)
    }

    fn update(&self, id: BackupId, change: impl FnOnce(&mut BackupDescriptor)) -> BlobResult<()> {
        let mut ledger = self.ledger.lock();
        if let Some(descriptor) = ledger.descriptors.get_mut(&id) {
            change(descriptor);
        }
        meta::save(&self.path, BACKUPS_MAGIC, &*ledger)
    }

    /// Returns one descriptor.
    pub fn descriptor(&self, id: BackupId) -> Option<BackupDescriptor> {
        self.ledger.lock().descriptors.get(&id).cloned()
    }

    /// Lists every known backup.
    pub fn list(&self) -> Vec<BackupDescriptor> {
        self.ledger.lock().descriptors.values().cloned().collect()
    }
}

/// A database's running (or last) backup.
#[derive(Debug)]
pub(crate) struct BackupTask {
    id: BackupId,
    destination: PathBuf,
    bytes_total: u64,
    bytes_done: AtomicU64,
    cancelled: AtomicBool,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackupTask {
    pub(crate) fn id(&self) -> BackupId {
        self.id
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(backup = %self.id, "backup thread panicked");
            }
        }
    }

    fn status(&self) -> BackupStatus {
        BackupStatus {
            id: self.id,
            bytes_total: self.bytes_total,
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            running: self.is_running(),
        }
    }
}

/// Repositories and table directory captured at the start of a backup.
struct Cut {
    repos: Vec<(RepoStateGuard, u64)>,
    tables: Vec<TableEntry>,
}

fn take_cut(db: &Database) -> BlobResult<Cut> {
    let _workers = db.suspend_workers();
    let _compaction = db.compaction.lock();
    let mut repos = Vec::new();
    for repo in db.repositories_snapshot() {
        if repo.is_delete_pending() {
            continue;
        }
        let guard = repo.begin_backup()?;
        let end = guard.size();
        repos.push((guard, end));
    }
    let tables = db
        .tables
        .entries()
        .into_iter()
        .filter(|entry| !entry.to_delete)
        .collect();
    Ok(Cut { repos, tables })
}

/// Starts a backup of `db` into `destination`.
pub(crate) fn start(db: &Arc<Database>, manager: &Arc<BackupManager>, destination: &Path) -> BlobResult<BackupId> {
    db.check_open()?;
    let mut slot = db.backup.lock();
    if slot.as_ref().is_some_and(|task| task.is_running()) {
        return Err(BlobError::busy(format!("database {} is already backing up", db.name())));
    }
    let dump_path = destination.join(DUMP_FILE_NAME);
    if dump_path.exists() {
        return Err(BlobError::duplicate(format!("dump {}", dump_path.display())));
    }
    fs::create_dir_all(destination)?;

    let cut = take_cut(db)?;
    let id = manager.register(db, destination)?;
    let bytes_total = cut
        .repos
        .iter()
        .map(|(_, end)| end.saturating_sub(RepoHeader::SIZE as u64))
        .sum();
    let task = Arc::new(BackupTask {
        id,
        destination: destination.to_path_buf(),
        bytes_total,
        bytes_done: AtomicU64::new(0),
        cancelled: AtomicBool::new(false),
        running: AtomicBool::new(true),
        handle: Mutex::new(None),
    });

    let thread_db = Arc::clone(db);
    let thread_task = Arc::clone(&task);
    let thread_manager = Arc::clone(manager);
    let handle = thread::Builder::new()
        .name(format!("nexus-backup-{id}"))
        .spawn(move || run(&thread_db, &thread_task, &thread_manager, cut))
        .map_err(|e| BlobError::config(format!("failed to spawn backup thread: {e}")))?;
    *task.handle.lock() = Some(handle);
    *slot = Some(task);

    tracing::info!(db = %db.id(), backup = %id, destination = %destination.display(), bytes_total, "backup started");
    Ok(id)
}

fn run(db: &Database, task: &BackupTask, manager: &BackupManager, cut: Cut) {
    let dump_path = task.destination.join(DUMP_FILE_NAME);
    let result = write_dump(db, task, &cut, &dump_path);

    drop(cut);
    for repo in db.repositories_snapshot() {
        if repo.is_delete_pending() && !repo.is_backing_up() {
            if let Err(e) = db.remove_repository(repo.id()) {
                tracing::warn!(repo = %repo.id(), error = %e, "failed to delete compacted repository");
            }
        }
    }

    let outcome = match result {
        Ok((blobs, bytes)) => {
            tracing::info!(backup = %task.id, blobs, bytes, "backup completed");
            manager.update(task.id, |d| {
                d.state = BackupState::Completed;
                d.blobs = blobs;
                d.bytes = bytes;
                d.finished = Some(Timestamp::now());
            })
        }
        Err(e) => {
            if let Err(re) = fs::remove_file(&dump_path) {
                tracing::debug!(path = %dump_path.display(), error = %re, "no partial dump to remove");
            }
            let cancelled = task.is_cancelled();
            if cancelled {
                tracing::info!(backup = %task.id, "backup terminated");
            } else {
                tracing::error!(backup = %task.id, error = %e, "backup failed");
            }
            manager.update(task.id, |d| {
                d.state = if cancelled {
                    BackupState::Terminated
                } else {
                    BackupState::Failed
                };
                d.error = (!cancelled).then(|| e.to_string());
                d.finished = Some(Timestamp::now());
            })
        }
    };
    if let Err(e) = outcome {
        tracing::error!(backup = %task.id, error = %e, "failed to record backup outcome");
    }
    task.running.store(false, Ordering::Release);
}

fn write_dump(db: &Database, task: &BackupTask, cut: &Cut, path: &Path) -> BlobResult<(u64, u64)> {
    let mut config = (*db.config).clone();
    if let Some(cloud) = config.cloud.as_mut() {
        cloud.private_key.clear();
    }
    let manifest = DumpManifest {
        source_db: db.id(),
        source_name: db.name().to_string(),
        backup_id: task.id,
        blob_head_size: cut
            .repos
            .first()
            .map_or(0, |(repo, _)| repo.default_head_size() as u16),
        tables: cut.tables.clone(),
        config,
        created: Timestamp::now(),
    };

    let mut writer = DumpWriter::create(path)?;
    writer.write_frame(FrameKind::Manifest, &manifest.encode()?)?;

    let mut blobs = 0u64;
    for (repo, end) in &cut.repos {
        let mut scanner = repo.scan_to(*end)?;
        for scanned in scanner.by_ref() {
            if task.is_cancelled() {
                return Err(BlobError::busy("backup terminated"));
            }
            let offset = match scanned {
                Ok(scanned) => scanned.offset,
                Err(e) if e.is_corruption() => {
                    tracing::warn!(repo = %repo.id(), error = %e, "skipping unreadable record");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let _guard = repo.lock_record(offset);
            let mut header = repo.read_header(offset)?;
            task.bytes_done
                .fetch_add(header.record_size(), Ordering::Relaxed);
            if !matches!(header.status, BlobStatus::Referenced | BlobStatus::Moved) {
                continue;
            }
            header.retain_committed();
            if header.committed_ref_count() == 0 {
                continue;
            }
            header.status = BlobStatus::Referenced;
            header.backup_id = task.id;

            if header.storage_type == StorageType::Cloud {
                db.cloud_store()?
                    .backup_copy(&db.cloud_key(&header), task.id.as_u32())?;
            }
            let mut payload = BlobReader::new(
                ReaderSource::File {
                    file: repo.file()?,
                    base: offset + header.head_size() as u64,
                },
                header.repo_size,
            );
            writer.write_streamed(FrameKind::Blob, &header.encode(), &mut payload, header.repo_size)?;
            blobs += 1;
        }
        if scanner.skipped() > 0 {
            tracing::warn!(repo = %repo.id(), skipped = scanner.skipped(), "backup skipped unreadable bytes");
        }
    }

    writer.write_frame(FrameKind::End, &blobs.to_be_bytes())?;
    let bytes = writer.finish()?;
    Ok((blobs, bytes))
}

/// Progress of the database's current or last backup.
pub(crate) fn status(db: &Database) -> Option<BackupStatus> {
    db.backup.lock().as_ref().map(|task| task.status())
}

/// Stops the running backup, removes its partial dump and renames the
/// destination to `<destination>.terminated`.
pub(crate) fn terminate(db: &Database) -> BlobResult<BackupId> {
    let task = db
        .backup
        .lock()
        .clone()
        .filter(|task| task.is_running())
        .ok_or_else(|| BlobError::not_found(format!("running backup of {}", db.name())))?;
    task.cancel();
    task.join();

    let mut renamed = task.destination.clone().into_os_string();
    renamed.push(TERMINATED_SUFFIX);
    let renamed = PathBuf::from(renamed);
    if task.destination.exists() {
        if renamed.exists() {
            fs::remove_dir_all(&renamed)?;
        }
        fs::rename(&task.destination, &renamed)?;
    }
    tracing::info!(backup = %task.id, moved_to = %renamed.display(), "backup destination set aside");
    Ok(task.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(id: u32, state: BackupState) -> BackupDescriptor {
        BackupDescriptor {
            id: BackupId::new(id),
            db_name: "db".into(),
            db_id: DatabaseId::new(1),
            destination: PathBuf::from("/backups").join(id.to_string()),
            state,
            started: Timestamp::from_secs(100),
            finished: None,
            blobs: 0,
            bytes: 0,
            error: None,
        }
    }

    #[test]
    fn test_interrupted_backups_marked_failed() {
        let dir = TempDir::new().unwrap();
        let mut ledger = BackupLedger {
            next_id: 3,
            ..Default::default()
        };
        for d in [descriptor(1, BackupState::Completed), descriptor(2, BackupState::Running)] {
            ledger.descriptors.insert(d.id, d);
        }
        meta::save(&dir.path().join(BACKUPS_FILE), BACKUPS_MAGIC, &ledger).unwrap();

        let manager = BackupManager::open(dir.path()).unwrap();
        assert_eq!(manager.list().len(), 2);
        assert_eq!(
            manager.descriptor(BackupId::new(1)).unwrap().state,
            BackupState::Completed
        );
        let interrupted = manager.descriptor(BackupId::new(2)).unwrap();
        assert_eq!(interrupted.state, BackupState::Failed);
        assert!(interrupted.error.is_some());

        // The change was written back.
        let reopened = BackupManager::open(dir.path()).unwrap();
        assert_eq!(
            reopened.descriptor(BackupId::new(2)).unwrap().state,
            BackupState::Failed
        );
    }

    #[test]
    fn test_empty_ledger() {
        let dir = TempDir::new().unwrap();
        let manager = BackupManager::open(dir.path()).unwrap();
        assert!(manager.list().is_empty());
        assert!(manager.descriptor(BackupId::new(1)).is_none());
    }
}
