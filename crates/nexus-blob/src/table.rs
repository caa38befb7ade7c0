//! Table directory.
//!
//! Maps table names to ids and owns the indirection file of each table. The
//! directory itself is persisted in `tables.dir`; indirection files live in
//! `tables/`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use nexus_common::constants::TABLE_VERSION;
use nexus_common::error::{BlobError, BlobResult};
use nexus_common::types::{TableId, Timestamp};

use crate::indirection::TableIndirection;
use crate::meta;

const DIRECTORY_FILE: &str = "tables.dir";
const DIRECTORY_MAGIC: u32 = 0x4E58_5444;
const INDIRECTION_DIR: &str = "tables";

/// One table known to a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    /// Table id.
    pub id: TableId,
    /// Table name.
    pub name: String,
    /// Marked for deletion; reclaimed by the deferred-action processor.
    pub to_delete: bool,
    /// Indirection file format version.
    pub format_version: u16,
    /// Creation time.
    pub create_time: Timestamp,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryFile {
    next_id: u32,
    tables: Vec<TableEntry>,
}

struct DirectoryState {
    next_id: TableId,
    entries: BTreeMap<TableId, TableEntry>,
    by_name: HashMap<String, TableId>,
}

impl DirectoryState {
    fn new() -> Self {
        Self {
            next_id: TableId::new(1),
            entries: BTreeMap::new(),
            by_name: HashMap::new(),
        }
    }

    fn insert(&mut self, entry: TableEntry) {
        if !entry.to_delete {
            self.by_name.insert(entry.name.clone(), entry.id);
        }
        if entry.id >= self.next_id {
            self.next_id = entry.id.next();
        }
        self.entries.insert(entry.id, entry);
    }

    fn to_file(&self) -> DirectoryFile {
        DirectoryFile {
            next_id: self.next_id.as_u32(),
            tables: self.entries.values().cloned().collect(),
        }
    }
}

/// Name-to-id catalog plus open indirection files.
pub struct TableDirectory {
    dir: PathBuf,
    state: RwLock<DirectoryState>,
    open: RwLock<HashMap<TableId, Arc<TableIndirection>>>,
}

impl TableDirectory {
    /// Opens (or initializes) the directory of the database at `db_dir`.
    pub fn open(db_dir: &Path) -> BlobResult<Self> {
        fs::create_dir_all(db_dir.join(INDIRECTION_DIR))?;
        let mut state = DirectoryState::new();
        if let Some(file) = meta::load::<DirectoryFile>(&db_dir.join(DIRECTORY_FILE), DIRECTORY_MAGIC)? {
            for entry in file.tables {
                state.insert(entry);
            }
            state.next_id = state.next_id.max(TableId::new(file.next_id));
        }
        tracing::debug!(dir = %db_dir.display(), tables = state.entries.len(), "opened table directory");

        Ok(Self {
            dir: db_dir.to_path_buf(),
            state: RwLock::new(state),
            open: RwLock::new(HashMap::new()),
        })
    }

    fn indirection_dir(&self) -> PathBuf {
        self.dir.join(INDIRECTION_DIR)
    }

    fn persist(&self, state: &DirectoryState) -> BlobResult<()> {
        meta::save(&self.dir.join(DIRECTORY_FILE), DIRECTORY_MAGIC, &state.to_file())
    }

    fn check_name(name: &str) -> BlobResult<()> {
        if name.is_empty() {
            return Err(BlobError::invalid_argument("table name must not be empty"));
        }
        Ok(())
    }

    /// Creates a table; `Duplicate` if the name is taken.
    pub fn create_table(&self, name: &str) -> BlobResult<TableId> {
        Self::check_name(name)?;
        let mut state = self.state.write();
        if state.by_name.contains_key(name) {
            return Err(BlobError::duplicate(format!("table {name:?}")));
        }
        let id = state.next_id;
        let indirection = TableIndirection::create(id, &self.indirection_dir())?;
        state.insert(TableEntry {
            id,
            name: name.to_string(),
            to_delete: false,
            format_version: TABLE_VERSION,
            create_time: Timestamp::now(),
        });
        self.persist(&state)?;
        self.open.write().insert(id, Arc::new(indirection));
        tracing::debug!(table = %id, name, "created table");
        Ok(id)
    }

    /// Returns the id of `name`, creating the table on first use.
    pub fn table_or_create(&self, name: &str) -> BlobResult<TableId> {
        match self.table_id(name) {
            Ok(id) => Ok(id),
            Err(e) if e.is_not_found() => match self.create_table(name) {
                Err(e) if e.is_recoverable() => self.table_id(name),
                other => other,
            },
            Err(e) => Err(e),
        }
    }

    /// Returns the id of a live table.
    pub fn table_id(&self, name: &str) -> BlobResult<TableId> {
        self.state
            .read()
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| BlobError::not_found(format!("table {name:?}")))
    }

    /// Returns the entry of a table, live or dropped.
    pub fn entry(&self, id: TableId) -> BlobResult<TableEntry> {
        self.state
            .read()
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| BlobError::not_found(format!("table {id}")))
    }

    /// Lists all tables.
    pub fn entries(&self) -> Vec<TableEntry> {
        self.state.read().entries.values().cloned().collect()
    }

    /// Renames a live table.
    pub fn rename_table(&self, from: &str, to: &str) -> BlobResult<()> {
        Self::check_name(to)?;
        let mut state = self.state.write();
        if state.by_name.contains_key(to) {
            return Err(BlobError::duplicate(format!("table {to:?}")));
        }
        let id = state
            .by_name
            .remove(from)
            .ok_or_else(|| BlobError::not_found(format!("table {from:?}")))?;
        state.by_name.insert(to.to_string(), id);
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.name = to.to_string();
        }
        self.persist(&state)?;
        tracing::debug!(table = %id, from, to, "renamed table");
        Ok(())
    }

    /// Marks a table for deletion and frees its name.
    pub fn mark_dropped(&self, id: TableId) -> BlobResult<()> {
        let mut state = self.state.write();
        let entry = state
            .entries
            .get_mut(&id)
            .ok_or_else(|| BlobError::not_found(format!("table {id}")))?;
        if entry.to_delete {
            return Ok(());
        }
        entry.to_delete = true;
        let name = entry.name.clone();
        state.by_name.remove(&name);
        self.persist(&state)
    }

    /// Returns true if the table exists and is marked for deletion.
    pub fn is_dropped(&self, id: TableId) -> bool {
        self.state
            .read()
            .entries
            .get(&id)
            .is_some_and(|e| e.to_delete)
    }

    /// Returns true if the table exists and is not marked for deletion.
    pub fn is_live(&self, id: TableId) -> bool {
        self.state
            .read()
            .entries
            .get(&id)
            .is_some_and(|e| !e.to_delete)
    }

    /// Returns the indirection file of a table, opening it on first use.
    pub fn indirection(&self, id: TableId) -> BlobResult<Arc<TableIndirection>> {
        if let Some(table) = self.open.read().get(&id) {
            return Ok(Arc::clone(table));
        }
        if !self.state.read().entries.contains_key(&id) {
            return Err(BlobError::not_found(format!("table {id}")));
        }
        let mut open = self.open.write();
        if let Some(table) = open.get(&id) {
            return Ok(Arc::clone(table));
        }
        let path = self.indirection_dir().join(TableIndirection::file_name(id));
        let table = if path.exists() {
            TableIndirection::open(id, path)?
        } else {
            TableIndirection::create(id, &self.indirection_dir())?
        };
        let table = Arc::new(table);
        open.insert(id, Arc::clone(&table));
        Ok(table)
    }

    /// Removes a dropped table and its indirection file.
    pub fn purge(&self, id: TableId) -> BlobResult<()> {
        let mut state = self.state.write();
        if state.entries.remove(&id).is_none() {
            return Ok(());
        }
        self.persist(&state)?;
        let table = self.open.write().remove(&id);
        match table {
            Some(table) => table.remove_file()?,
            None => {
                let path = self.indirection_dir().join(TableIndirection::file_name(id));
                if path.exists() {
                    fs::remove_file(path)?;
                }
            }
        }
        tracing::info!(table = %id, "purged dropped table");
        Ok(())
    }

    /// Recreates a table with a fixed id, for restore.
    pub fn restore_table(&self, entry: &TableEntry) -> BlobResult<Arc<TableIndirection>> {
        if entry.format_version != TABLE_VERSION {
            return Err(BlobError::protocol_mismatch(format!(
                "table {:?} has format version {}, expected {TABLE_VERSION}",
                entry.name, entry.format_version
            )));
        }
        let mut state = self.state.write();
        if state.entries.contains_key(&entry.id) || state.by_name.contains_key(&entry.name) {
            return Err(BlobError::duplicate(format!("table {:?}", entry.name)));
        }
        let indirection = Arc::new(TableIndirection::create(entry.id, &self.indirection_dir())?);
        state.insert(TableEntry {
            to_delete: false,
            ..entry.clone()
        });
        self.persist(&state)?;
        self.open.write().insert(entry.id, Arc::clone(&indirection));
        Ok(indirection)
    }

    /// Flushes every open indirection file.
    pub fn sync(&self) -> BlobResult<()> {
        for table in self.open.read().values() {
            table.sync()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TableDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableDirectory")
            .field("dir", &self.dir)
            .field("tables", &self.state.read().entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_lookup_rename() {
        let dir = TempDir::new().unwrap();
        let tables = TableDirectory::open(dir.path()).unwrap();
        let a = tables.create_table("photos").unwrap();
        assert_eq!(tables.table_id("photos").unwrap(), a);
        assert!(tables.create_table("photos").unwrap_err().is_recoverable());

        tables.rename_table("photos", "images").unwrap();
        assert!(tables.table_id("photos").unwrap_err().is_not_found());
        assert_eq!(tables.table_id("images").unwrap(), a);
        assert_eq!(tables.table_or_create("images").unwrap(), a);
        let b = tables.table_or_create("docs").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_directory_persists() {
        let dir = TempDir::new().unwrap();
        let id = {
            let tables = TableDirectory::open(dir.path()).unwrap();
            let id = tables.create_table("t").unwrap();
            tables.indirection(id).unwrap().allocate_handle().unwrap();
            id
        };
        let tables = TableDirectory::open(dir.path()).unwrap();
        assert_eq!(tables.table_id("t").unwrap(), id);
        assert_eq!(tables.indirection(id).unwrap().slot_count(), 1);
        assert!(tables.create_table("u").unwrap() > id);
    }

    #[test]
    fn test_soft_drop_and_purge() {
        let dir = TempDir::new().unwrap();
        let tables = TableDirectory::open(dir.path()).unwrap();
        let id = tables.create_table("t").unwrap();
        let path = tables.indirection(id).unwrap().path().to_path_buf();

        tables.mark_dropped(id).unwrap();
        assert!(tables.is_dropped(id));
        assert!(tables.table_id("t").is_err());
        // The name is free again while the old table awaits reclamation.
        let again = tables.create_table("t").unwrap();
        assert_ne!(again, id);
        assert!(tables.indirection(id).is_ok());

        tables.purge(id).unwrap();
        assert!(!path.exists());
        assert!(tables.entry(id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_restore_table_checks_version() {
        let dir = TempDir::new().unwrap();
        let tables = TableDirectory::open(dir.path()).unwrap();
        let entry = TableEntry {
            id: TableId::new(7),
            name: "r".into(),
            to_delete: false,
            format_version: TABLE_VERSION + 1,
            create_time: Timestamp::ZERO,
        };
        assert!(matches!(
            tables.restore_table(&entry).unwrap_err(),
            BlobError::ProtocolMismatch { .. }
        ));
        let ok = TableEntry {
            format_version: TABLE_VERSION,
            ..entry
        };
        tables.restore_table(&ok).unwrap();
        assert_eq!(tables.table_id("r").unwrap(), TableId::new(7));
        assert_eq!(tables.create_table("s").unwrap(), TableId::new(8));
    }
}
