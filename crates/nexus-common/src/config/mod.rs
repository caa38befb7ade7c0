//! Configuration for the BLOB engine.
//!
//! This module provides the engine configuration and its cloud section.

mod engine;

pub use engine::{CloudConfig, EngineConfig, StorageType};
