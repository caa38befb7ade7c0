//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::thread;
use std::time::Duration;

use nexus_blob::{BlobEngine, Database};
use nexus_common::config::EngineConfig;
use tempfile::TempDir;

/// Starts an engine with the test configuration.
pub fn engine(dir: &TempDir) -> BlobEngine {
    engine_with(EngineConfig::for_testing(dir.path().join("data")))
}

/// Starts an engine with a custom configuration.
pub fn engine_with(config: EngineConfig) -> BlobEngine {
    init_tracing();
    BlobEngine::init(config).expect("Failed to start engine")
}

/// Routes engine logs through the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Waits out the one second grace period of the test configuration, rounded
/// up to whole log seconds, then applies every due deferred action.
pub fn pass_grace_period(db: &Database) {
    thread::sleep(Duration::from_millis(2100));
    db.flush_deferred().expect("Failed to apply deferred actions");
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
