//! Database instances.
//!
//! A database owns its repository files, table directory, temp log, alias
//! index and two background workers:
//!
//! ```text
//! <data_dir>/<name>/
//!   db.meta                   id, name, creation time
//!   tables.dir                table directory
//!   tables/table-*.bst        indirection files
//!   repos/repo-*.bs           repository files
//!   templog/temp-*.bs         deferred-action log
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use nexus_common::config::EngineConfig;
use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::{BlobHandle, DatabaseId, RepoId, TableId, Timestamp};
use nexus_templog::{ActionRecord, TempLog, TempLogConfig};

use crate::backup::BackupTask;
use crate::cloud::{CloudKey, CloudStore};
use crate::compactor::CompactionReport;
use crate::deferred::DeferredProcessor;
use crate::meta;
use crate::record::BlobHeader;
use crate::repository::{FilePool, RepoHeader, RepoStateGuard, Repository};
use crate::stats::{DatabaseStats, DatabaseStatsSnapshot, RepositoryInfo};
use crate::table::{TableDirectory, TableEntry};
use crate::worker::{SuspendGuard, Worker, WorkerSignal};

const META_FILE: &str = "db.meta";
const META_MAGIC: u32 = 0x4E58_444D;
const REPO_DIR: &str = "repos";
const TEMP_LOG_DIR: &str = "templog";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatabaseMeta {
    id: DatabaseId,
    name: String,
    create_time: Timestamp,
}

/// One BLOB database.
pub struct Database {
    pub(crate) id: DatabaseId,
    pub(crate) name: String,
    pub(crate) dir: PathBuf,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) pool: Arc<FilePool>,
    pub(crate) repos: RwLock<BTreeMap<RepoId, Arc<Repository>>>,
    next_repo_id: Mutex<RepoId>,
    pub(crate) tables: TableDirectory,
    pub(crate) temp_log: TempLog,
    pub(crate) cloud: Option<Arc<dyn CloudStore>>,
    pub(crate) cloud_seq: AtomicU32,
    /// Alias to handle; `None` marks an alias reserved by an operation in
    /// progress.
    pub(crate) aliases: DashMap<String, Option<BlobHandle>>,
    pub(crate) stats: DatabaseStats,
    pub(crate) processor: Mutex<DeferredProcessor>,
    pub(crate) processor_signal: Arc<WorkerSignal>,
    pub(crate) compaction: Mutex<()>,
    pub(crate) compactor_signal: Arc<WorkerSignal>,
    workers: Mutex<Vec<Worker>>,
    pub(crate) backup: Mutex<Option<Arc<BackupTask>>>,
    closed: AtomicBool,
}

impl Database {
    /// Opens the database `name`, creating it if needed.
    ///
    /// `new_id` is called only when the database does not exist yet.
    pub(crate) fn open(
        name: &str,
        config: Arc<EngineConfig>,
        cloud: Option<Arc<dyn CloudStore>>,
        new_id: impl FnOnce() -> BlobResult<DatabaseId>,
    ) -> BlobResult<Arc<Self>> {
        Self::check_name(name)?;
        let dir = config.data_dir.join(name);
        fs::create_dir_all(dir.join(REPO_DIR))?;

        let meta_path = dir.join(META_FILE);
        let db_meta = match meta::load::<DatabaseMeta>(&meta_path, META_MAGIC)? {
            Some(m) => m,
            None => {
                let m = DatabaseMeta {
                    id: new_id()?,
                    name: name.to_string(),
                    create_time: Timestamp::now(),
                };
                meta::save(&meta_path, META_MAGIC, &m)?;
                m
            }
        };

        let pool = Arc::new(FilePool::new(config.max_open_files));
        let mut repos = BTreeMap::new();
        for entry in fs::read_dir(dir.join(REPO_DIR))? {
            let entry = entry?;
            let Some(id) = entry.file_name().to_str().and_then(Repository::parse_file_name) else {
                continue;
            };
            match Repository::open(id, entry.path(), Arc::clone(&pool)) {
                Ok(repo) => {
                    repos.insert(id, repo);
                }
                Err(e) if e.is_corruption() => {
                    tracing::warn!(repo = %id, error = %e, "skipping unreadable repository");
                }
                Err(e) => return Err(e),
            }
        }
        let next_repo_id = repos.keys().next_back().map_or(RepoId::new(1), |id| id.next());

        let tables = TableDirectory::open(&dir)?;
        let temp_log = TempLog::open(
            TempLogConfig::new(dir.join(TEMP_LOG_DIR)).with_segment_threshold(config.temp_log_threshold),
        )?;
        let processor = DeferredProcessor::new(temp_log.reader());

        let db = Arc::new(Self {
            id: db_meta.id,
            name: db_meta.name,
            dir,
            config,
            pool,
            repos: RwLock::new(repos),
            next_repo_id: Mutex::new(next_repo_id),
            tables,
            temp_log,
            cloud,
            cloud_seq: AtomicU32::new(0),
            aliases: DashMap::new(),
            stats: DatabaseStats::default(),
            processor: Mutex::new(processor),
            processor_signal: Arc::new(WorkerSignal::new()),
            compaction: Mutex::new(()),
            compactor_signal: Arc::new(WorkerSignal::new()),
            workers: Mutex::new(Vec::new()),
            backup: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        db.rebuild_indexes()?;
        db.start_workers()?;
        tracing::info!(
            db = %db.id,
            name = %db.name,
            repositories = db.repos.read().len(),
            aliases = db.aliases.len(),
            "opened database"
        );
        Ok(db)
    }

    pub(crate) fn check_name(name: &str) -> BlobResult<()> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.ends_with(nexus_common::constants::TERMINATED_SUFFIX)
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if valid {
            Ok(())
        } else {
            Err(BlobError::invalid_argument(format!(
                "invalid database name {name:?}"
            )))
        }
    }

    /// True if `dir` holds a database.
    pub(crate) fn is_database_dir(dir: &Path) -> bool {
        dir.join(META_FILE).is_file()
    }

    /// Rebuilds the alias index and the cloud sequence from record headers,
    /// and drops references left uncommitted by a previous run.
    fn rebuild_indexes(&self) -> BlobResult<()> {
        let mut max_seq = 0;
        for repo in self.repositories_snapshot() {
            for scanned in repo.scan()? {
                let scanned = scanned?;
                let header = &scanned.header;
                if !header.status.is_live() {
                    continue;
                }
                max_seq = max_seq.max(header.cloud_seq);
                let pending = header.uncommitted_ref_count() > 0;
                if !pending && header.alias().is_none() {
                    continue;
                }
                let Some(handle) = self.current_handle(&repo, scanned.offset, header)? else {
                    continue;
                };
                if pending {
                    self.discard_pending_refs(&repo, scanned.offset)?;
                }
                if let Some(alias) = header.alias() {
                    self.aliases.insert(alias.to_string(), Some(handle));
                }
            }
        }
        self.cloud_seq.store(max_seq.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Frees the uncommitted references of one record. No transaction
    /// survives a restart, so a record left without references is queued
    /// for deletion again.
    fn discard_pending_refs(&self, repo: &Repository, offset: u64) -> BlobResult<()> {
        let _guard = repo.lock_record(offset);
        let mut header = repo.read_header(offset)?;
        let discarded = header.discard_uncommitted();
        if discarded == 0 {
            return Ok(());
        }
        if header.committed_ref_count() == 0 {
            self.queue_deletion(&mut header)?;
        }
        header.mod_time = Timestamp::now();
        repo.write_header(offset, &header)?;
        tracing::debug!(
            repo = %repo.id(),
            offset,
            discarded,
            deletion_pending = header.deletion_marker().is_some(),
            "discarded uncommitted references"
        );
        Ok(())
    }

    /// Returns a handle for the record at `(repo, offset)` if any of its
    /// table references still resolves to it.
    pub(crate) fn current_handle(
        &self,
        repo: &Repository,
        offset: u64,
        header: &BlobHeader,
    ) -> BlobResult<Option<BlobHandle>> {
        for (_, table_id, blob_id) in header.table_refs() {
            let Ok(table) = self.tables.indirection(table_id) else {
                continue;
            };
            if table.points_at(blob_id, repo.id(), offset)? {
                return Ok(Some(BlobHandle::new(
                    self.id,
                    table_id,
                    blob_id,
                    header.auth_code,
                    header.data_size,
                )));
            }
        }
        Ok(None)
    }

    fn start_workers(self: &Arc<Self>) -> BlobResult<()> {
        let interval = self.config.compactor_poll_interval();

        let weak: Weak<Self> = Arc::downgrade(self);
        let processor = Worker::spawn(
            format!("nexus-deferred-{}", self.id),
            Arc::clone(&self.processor_signal),
            interval,
            move || weak.upgrade().and_then(|db| db.run_deferred_pass()),
        )?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let compactor = Worker::spawn(
            format!("nexus-compactor-{}", self.id),
            Arc::clone(&self.compactor_signal),
            interval,
            move || {
                if let Some(db) = weak.upgrade() {
                    if let Err(e) = db.compact_now() {
                        tracing::error!(db = %db.id, error = %e, "compaction pass failed");
                    }
                }
                None
            },
        )?;

        let mut workers = self.workers.lock();
        workers.push(processor);
        workers.push(compactor);
        Ok(())
    }

    fn run_deferred_pass(&self) -> Option<Duration> {
        match self.processor.lock().run(self) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(db = %self.id, error = %e, "deferred-action pass failed");
                None
            }
        }
    }

    /// Suspends both background workers until the guards are dropped.
    pub(crate) fn suspend_workers(&self) -> (SuspendGuard<'_>, SuspendGuard<'_>) {
        (self.processor_signal.suspend(), self.compactor_signal.suspend())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Database id.
    pub fn id(&self) -> DatabaseId {
        self.id
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn check_open(&self) -> BlobResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BlobError::Closed);
        }
        Ok(())
    }

    pub(crate) fn cloud_store(&self) -> BlobResult<&Arc<dyn CloudStore>> {
        self.cloud
            .as_ref()
            .ok_or_else(|| BlobError::config("cloud storage is not configured"))
    }

    pub(crate) fn cloud_key(&self, header: &BlobHeader) -> CloudKey {
        CloudKey {
            db_id: self.id,
            create_time: header.create_time,
            seq: header.cloud_seq,
            cloud_ref: header.cloud_ref,
        }
    }

    // -------------------------------------------------------------------------
    // Repositories
    // -------------------------------------------------------------------------

    pub(crate) fn repository(&self, id: RepoId) -> BlobResult<Arc<Repository>> {
        self.repos
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| BlobError::not_found(format!("repository {id}")))
    }

    pub(crate) fn repositories_snapshot(&self) -> Vec<Arc<Repository>> {
        self.repos.read().values().cloned().collect()
    }

    fn create_repository(&self) -> BlobResult<Arc<Repository>> {
        let mut next = self.next_repo_id.lock();
        let id = *next;
        let repo = Repository::create(
            id,
            &self.dir.join(REPO_DIR),
            Arc::clone(&self.pool),
            self.config.default_ref_slots,
        )?;
        *next = id.next();
        self.repos.write().insert(id, Arc::clone(&repo));
        Ok(repo)
    }

    /// Takes a repository with room for `needed` bytes for writing, creating
    /// one if every candidate is full or busy.
    pub(crate) fn writable_repo(&self, needed: u64) -> BlobResult<RepoStateGuard> {
        let threshold = self.config.repository_threshold;
        for repo in self.repositories_snapshot() {
            if repo.is_delete_pending() {
                continue;
            }
            let empty = repo.size() <= RepoHeader::SIZE as u64;
            if !empty && repo.size().saturating_add(needed) > threshold {
                continue;
            }
            match repo.begin_write() {
                Ok(guard) => return Ok(guard),
                Err(e) if e.is_recoverable() => continue,
                Err(e) => return Err(e),
            }
        }
        self.create_repository()?.begin_write()
    }

    /// Removes a repository from the database and deletes its file.
    pub(crate) fn remove_repository(&self, id: RepoId) -> BlobResult<()> {
        let repo = self.repos.write().remove(&id);
        if let Some(repo) = repo {
            repo.remove_file()?;
        }
        Ok(())
    }

    /// Describes every repository file.
    pub fn repositories(&self) -> Vec<RepositoryInfo> {
        self.repositories_snapshot()
            .into_iter()
            .map(|repo| RepositoryInfo {
                id: repo.id(),
                size: repo.size(),
                garbage: repo.garbage(),
                garbage_percent: repo.garbage_percent(),
                lock_state: repo.lock_state(),
                delete_pending: repo.is_delete_pending(),
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Tables
    // -------------------------------------------------------------------------

    /// Creates a table.
    pub fn create_table(&self, name: &str) -> BlobResult<TableId> {
        self.check_open()?;
        self.tables.create_table(name)
    }

    /// Returns the id of a table, creating it on first use.
    pub fn table_or_create(&self, name: &str) -> BlobResult<TableId> {
        self.check_open()?;
        self.tables.table_or_create(name)
    }

    /// Returns the id of a table.
    pub fn table_id(&self, name: &str) -> BlobResult<TableId> {
        self.tables.table_id(name)
    }

    /// Renames a table.
    pub fn rename_table(&self, from: &str, to: &str) -> BlobResult<()> {
        self.check_open()?;
        self.tables.rename_table(from, to)
    }

    /// Drops a table. Its BLOB references are released once the grace
    /// period has passed.
    pub fn drop_table(&self, name: &str) -> BlobResult<()> {
        self.check_open()?;
        let id = self.tables.table_id(name)?;
        self.temp_log
            .append(&ActionRecord::drop_table(id, Timestamp::now()))?;
        self.tables.mark_dropped(id)?;
        tracing::info!(db = %self.id, table = %id, name, "dropped table");
        Ok(())
    }

    /// Lists tables, including dropped ones awaiting reclamation.
    pub fn tables(&self) -> Vec<TableEntry> {
        self.tables.entries()
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Runs one compaction pass now.
    pub fn compact_now(&self) -> BlobResult<CompactionReport> {
        self.check_open()?;
        crate::compactor::run_pass(self)
    }

    /// Applies every deferred action that is already due.
    pub fn flush_deferred(&self) -> BlobResult<()> {
        self.check_open()?;
        self.processor.lock().run(self)?;
        Ok(())
    }

    /// Wakes both background workers.
    pub fn wake_workers(&self) {
        self.processor_signal.wake();
        self.compactor_signal.wake();
    }

    /// Returns statistics.
    pub fn stats(&self) -> DatabaseStatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        for repo in self.repositories_snapshot() {
            snapshot.repositories += 1;
            snapshot.repository_bytes += repo.size();
            snapshot.garbage_bytes += repo.garbage();
        }
        snapshot.temp_log_segments = self.temp_log.segment_ids().len() as u64;
        snapshot.aliases = self.aliases.iter().filter(|e| e.value().is_some()).count() as u64;
        snapshot
    }

    /// Flushes all files.
    pub fn sync(&self) -> BlobResult<()> {
        for repo in self.repositories_snapshot() {
            repo.sync()?;
        }
        self.tables.sync()?;
        self.temp_log.sync()?;
        Ok(())
    }

    /// Stops background work and flushes all files. Further operations fail
    /// with `Closed`.
    pub fn shutdown(&self) -> BlobResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(task) = self.backup.lock().clone() {
            task.cancel();
            task.join();
        }
        for mut worker in self.workers.lock().drain(..) {
            worker.stop();
        }
        self.sync()?;
        self.temp_log.close()?;
        tracing::info!(db = %self.id, name = %self.name, "closed database");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(db = %self.id, error = %e, "error while closing database");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("repositories", &self.repos.read().len())
            .finish()
    }
}
