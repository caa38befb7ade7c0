//! Engine entry point.
//!
//! A [`BlobEngine`] owns every database under its data directory. Databases
//! are opened lazily on first use and stay open until dropped or the engine
//! shuts down.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use nexus_common::config::EngineConfig;
use nexus_common::constants::DUMP_FILE_NAME;
use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::{BackupId, DatabaseId};

use crate::backup::{self, BackupDescriptor, BackupManager, BackupStatus, RestoreSummary};
use crate::cloud::{self, CloudStore};
use crate::database::Database;

const ENGINE_FILE: &str = "engine.meta";
const ENGINE_MAGIC: u32 = 0x4E58_454E;

#[derive(Debug, Default, Serialize, Deserialize)]
struct EngineMeta {
    next_db_id: u32,
}

/// The BLOB engine.
///
/// # Example
///
/// ```no_run
/// use nexus_blob::{BlobEngine, Metadata};
/// use nexus_common::config::EngineConfig;
/// use nexus_common::types::RefId;
///
/// # fn main() -> nexus_common::error::BlobResult<()> {
/// let engine = BlobEngine::init(EngineConfig::new("/var/lib/blobs"))?;
/// let db = engine.database("media")?;
/// let table = db.table_or_create("photos")?;
/// let handle = db.create_blob(table, b"jpeg bytes", Metadata::new())?;
/// let handle = db.reference_blob(&handle, table, 1, RefId::new(42))?;
/// assert_eq!(&db.read_blob(&handle, ..)?[..], b"jpeg bytes");
/// # Ok(())
/// # }
/// ```
pub struct BlobEngine {
    config: Arc<EngineConfig>,
    cloud: Option<Arc<dyn CloudStore>>,
    databases: RwLock<HashMap<String, Arc<Database>>>,
    meta: Mutex<EngineMeta>,
    backups: Arc<BackupManager>,
    closed: AtomicBool,
}

impl BlobEngine {
    /// Validates `config` and opens the engine rooted at its data directory.
    pub fn init(config: EngineConfig) -> BlobResult<Self> {
        config.validate().map_err(BlobError::config)?;
        fs::create_dir_all(&config.data_dir)?;

        let cloud = match &config.cloud {
            Some(settings) => Some(cloud::from_config(settings)?),
            None => None,
        };
        let meta = crate::meta::load::<EngineMeta>(&config.data_dir.join(ENGINE_FILE), ENGINE_MAGIC)?
            .unwrap_or_default();
        let backups = Arc::new(BackupManager::open(&config.data_dir)?);

        tracing::info!(
            data_dir = %config.data_dir.display(),
            storage = ?config.storage_type,
            "blob engine started"
        );
        Ok(Self {
            config: Arc::new(config),
            cloud,
            databases: RwLock::new(HashMap::new()),
            meta: Mutex::new(meta),
            backups,
            closed: AtomicBool::new(false),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn check_open(&self) -> BlobResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BlobError::Closed);
        }
        Ok(())
    }

    fn allocate_db_id(&self) -> BlobResult<DatabaseId> {
        let mut meta = self.meta.lock();
        meta.next_db_id = meta.next_db_id.max(1);
        let id = DatabaseId::new(meta.next_db_id);
        meta.next_db_id += 1;
        crate::meta::save(&self.config.data_dir.join(ENGINE_FILE), ENGINE_MAGIC, &*meta)?;
        Ok(id)
    }

    /// Returns the database `name`, opening or creating it on first use.
    pub fn database(&self, name: &str) -> BlobResult<Arc<Database>> {
        self.check_open()?;
        if let Some(db) = self.databases.read().get(name) {
            return Ok(Arc::clone(db));
        }
        let mut databases = self.databases.write();
        if let Some(db) = databases.get(name) {
            return Ok(Arc::clone(db));
        }
        let db = Database::open(name, Arc::clone(&self.config), self.cloud.clone(), || {
            self.allocate_db_id()
        })?;
        databases.insert(name.to_string(), Arc::clone(&db));
        Ok(db)
    }

    /// Shuts a database down and deletes its directory.
    pub fn drop_database(&self, name: &str) -> BlobResult<()> {
        self.check_open()?;
        Database::check_name(name)?;
        if !self.databases.read().contains_key(name)
            && !Database::is_database_dir(&self.config.data_dir.join(name))
        {
            return Err(BlobError::not_found(format!("database {name}")));
        }
        let db = self.database(name)?;
        if backup::status(&db).is_some_and(|status| status.running) {
            return Err(BlobError::busy(format!("database {name} is backing up")));
        }
        self.databases.write().remove(name);
        db.shutdown()?;
        let dir = db.dir().to_path_buf();
        drop(db);
        fs::remove_dir_all(&dir)?;
        tracing::info!(name, "dropped database");
        Ok(())
    }

    /// Lists databases present on disk.
    pub fn list_databases(&self) -> BlobResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if Database::check_name(&name).is_ok() && Database::is_database_dir(&entry.path()) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    // -------------------------------------------------------------------------
    // Backup and restore
    // -------------------------------------------------------------------------

    /// Starts an online backup of `name` into `destination`.
    pub fn start_backup(&self, name: &str, destination: &Path) -> BlobResult<BackupId> {
        let db = self.database(name)?;
        backup::start(&db, &self.backups, destination)
    }

    /// Progress of the current or last backup of `name`.
    pub fn backup_status(&self, name: &str) -> BlobResult<Option<BackupStatus>> {
        Ok(backup::status(&*self.database(name)?))
    }

    /// Stops the running backup of `name`.
    pub fn terminate_backup(&self, name: &str) -> BlobResult<BackupId> {
        backup::terminate(&*self.database(name)?)
    }

    /// Blocks until the current backup of `name` has finished.
    pub fn wait_for_backup(&self, name: &str) -> BlobResult<Option<BackupDescriptor>> {
        let db = self.database(name)?;
        let task = db.backup.lock().clone();
        Ok(task.and_then(|task| {
            task.join();
            self.backups.descriptor(task.id())
        }))
    }

    /// Every backup the engine knows about.
    pub fn backups(&self) -> Vec<BackupDescriptor> {
        self.backups.list()
    }

    /// Creates database `name` from the dump in `source`.
    pub fn restore(&self, name: &str, source: &Path) -> BlobResult<RestoreSummary> {
        self.check_open()?;
        Database::check_name(name)?;
        if self.databases.read().contains_key(name)
            || Database::is_database_dir(&self.config.data_dir.join(name))
        {
            return Err(BlobError::duplicate(format!("database {name}")));
        }
        let dump = source.join(DUMP_FILE_NAME);
        if !dump.is_file() {
            return Err(BlobError::not_found(format!("dump {}", dump.display())));
        }

        let db = self.database(name)?;
        match backup::restore_into(&db, &dump) {
            Ok(summary) => {
                tracing::info!(name, blobs = summary.blobs_restored, "restored database");
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(name, error = %e, "restore failed, removing partial database");
                drop(db);
                if let Err(de) = self.drop_database(name) {
                    tracing::warn!(name, error = %de, "failed to remove partial database");
                }
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Shuts every open database down.
    pub fn shutdown(&self) -> BlobResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let databases: Vec<_> = self.databases.write().drain().map(|(_, db)| db).collect();
        let mut first_error = None;
        for db in databases {
            if let Err(e) = db.shutdown() {
                tracing::error!(db = %db.id(), error = %e, "failed to close database");
                first_error.get_or_insert(e);
            }
        }
        tracing::info!("blob engine stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for BlobEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "error while stopping blob engine");
        }
    }
}

impl std::fmt::Debug for BlobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobEngine")
            .field("data_dir", &self.config.data_dir)
            .field("databases", &self.databases.read().len())
            .finish()
    }
}
