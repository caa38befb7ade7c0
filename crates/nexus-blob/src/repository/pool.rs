//! Bounded pool of open repository files.
//!
//! Files are shared as `Arc<File>` and accessed with positional reads and
//! writes, so any number of threads can use one handle at once. When more
//! than `max_open` files are open, handles not borrowed by anyone are closed,
//! least recently used first.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use nexus_common::error::BlobResult;

struct PoolEntry {
    file: Arc<File>,
    last_used: Instant,
}

/// Pool statistics.
#[derive(Debug, Default)]
pub struct FilePoolStats {
    /// Handles served from the pool.
    pub hits: AtomicU64,
    /// Handles that had to be opened.
    pub opens: AtomicU64,
    /// Idle handles closed to stay under the limit.
    pub evictions: AtomicU64,
}

/// Shared pool of repository file handles.
pub struct FilePool {
    max_open: usize,
    entries: Mutex<HashMap<PathBuf, PoolEntry>>,
    stats: FilePoolStats,
}

impl FilePool {
    /// Creates a pool keeping at most `max_open` idle handles.
    pub fn new(max_open: usize) -> Self {
        Self {
            max_open: max_open.max(1),
            entries: Mutex::new(HashMap::new()),
            stats: FilePoolStats::default(),
        }
    }

    /// Borrows a handle for an existing file.
    pub fn get(&self, path: &Path) -> BlobResult<PooledFile> {
        self.checkout(path, false)
    }

    /// Creates a new file and borrows a handle for it.
    pub fn create(&self, path: &Path) -> BlobResult<PooledFile> {
        self.checkout(path, true)
    }

    fn checkout(&self, path: &Path, create: bool) -> BlobResult<PooledFile> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(path) {
            entry.last_used = Instant::now();
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(PooledFile {
                file: Arc::clone(&entry.file),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(create)
            .open(path)?;
        let file = Arc::new(file);
        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            path.to_path_buf(),
            PoolEntry {
                file: Arc::clone(&file),
                last_used: Instant::now(),
            },
        );
        self.evict_idle(&mut entries);
        Ok(PooledFile { file })
    }

    fn evict_idle(&self, entries: &mut HashMap<PathBuf, PoolEntry>) {
        while entries.len() > self.max_open {
            let victim = entries
                .iter()
                .filter(|(_, e)| Arc::strong_count(&e.file) == 1)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(p, _)| p.clone());
            match victim {
                Some(path) => {
                    entries.remove(&path);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                // Every handle is borrowed; the pool shrinks on a later checkout.
                None => break,
            }
        }
    }

    /// Forgets a file, e.g. before deleting it. Borrowed handles stay valid
    /// until dropped.
    pub fn remove(&self, path: &Path) {
        self.entries.lock().remove(path);
    }

    /// Number of handles held by the pool.
    pub fn open_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns pool statistics.
    pub fn stats(&self) -> &FilePoolStats {
        &self.stats
    }
}

impl std::fmt::Debug for FilePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePool")
            .field("max_open", &self.max_open)
            .field("open", &self.open_count())
            .finish()
    }
}

/// A borrowed file handle.
#[derive(Debug, Clone)]
pub struct PooledFile {
    file: Arc<File>,
}

impl PooledFile {
    /// Reads exactly `buf.len()` bytes at `offset`.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> BlobResult<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at `offset`, returning the count.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> BlobResult<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.file.read_at(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Writes all of `buf` at `offset`.
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> BlobResult<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Current file length.
    pub fn file_len(&self) -> BlobResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Flushes data and metadata.
    pub fn sync(&self) -> BlobResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Flushes data only.
    pub fn sync_data(&self) -> BlobResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_positional_io() {
        let dir = TempDir::new().unwrap();
        let pool = FilePool::new(4);
        let path = dir.path().join("a.bs");
        let file = pool.create(&path).unwrap();
        file.write_all_at(b"hello", 10).unwrap();

        let again = pool.get(&path).unwrap();
        let mut buf = [0u8; 5];
        again.read_exact_at(&mut buf, 10).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(again.file_len().unwrap(), 15);
        assert_eq!(again.read_at(&mut [0u8; 10], 12).unwrap(), 3);
        assert_eq!(pool.stats().hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_evicts_only_idle_handles() {
        let dir = TempDir::new().unwrap();
        let pool = FilePool::new(2);
        let held = pool.create(&dir.path().join("0")).unwrap();
        for i in 1..4 {
            drop(pool.create(&dir.path().join(i.to_string())).unwrap());
        }
        assert_eq!(pool.open_count(), 2);
        held.write_all_at(b"x", 0).unwrap();
        assert!(pool.stats().evictions.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = TempDir::new().unwrap();
        let pool = FilePool::new(2);
        let path = dir.path().join("a");
        drop(pool.create(&path).unwrap());
        pool.remove(&path);
        assert!(pool.create(&path).is_err());
        assert!(pool.get(&dir.path().join("missing")).is_err());
    }
}
