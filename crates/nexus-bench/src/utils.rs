//! Benchmark utilities and helpers.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use nexus_blob::{BlobEngine, Database};
use nexus_common::config::EngineConfig;

/// Generates `count` random payloads of `size` bytes.
pub fn generate_payloads(count: usize, size: usize) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count)
        .map(|_| (0..size).map(|_| rng.gen()).collect())
        .collect()
}

/// An engine in a temporary directory with one open database.
///
/// The background workers poll rarely so they stay out of the measurements.
pub struct BenchDb {
    pub db: Arc<Database>,
    pub engine: BlobEngine,
    _dir: TempDir,
}

impl BenchDb {
    /// Opens database `name` in a fresh temporary data directory.
    pub fn new(name: &str) -> Self {
        Self::with_config(name, |config| config)
    }

    /// Like [`BenchDb::new`], with a chance to adjust the configuration.
    pub fn with_config(name: &str, adjust: impl FnOnce(EngineConfig) -> EngineConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = EngineConfig::new(dir.path().join("data"))
            .with_compactor_poll_interval(Duration::from_secs(3600))
            .with_temp_blob_timeout(Duration::from_secs(3600));
        let engine = BlobEngine::init(adjust(config)).expect("Failed to start engine");
        let db = engine.database(name).expect("Failed to open database");
        Self {
            db,
            engine,
            _dir: dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payloads_are_deterministic() {
        let a = generate_payloads(3, 16);
        let b = generate_payloads(3, 16);
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert!(a.iter().all(|p| p.len() == 16));
    }

    #[test]
    fn test_bench_db_opens() {
        let bench = BenchDb::new("bench");
        assert_eq!(bench.db.name(), "bench");
        assert_eq!(bench.engine.list_databases().unwrap(), vec!["bench"]);
    }
}
