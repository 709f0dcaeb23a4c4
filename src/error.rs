//! Error types for refstream
//!
//! This module defines the error hierarchy for:
//! - Worker pool and worker creation errors
//! - Reference cache and cache table (SQLite) errors
//! - Local resolution errors (circular references, malformed coordinates)
//! - Configuration errors
//!
//! Expected conditions such as cache misses and queue timeouts are not
//! errors; they are returned as `Option` or as the rejected item.

use std::path::PathBuf;
use thiserror::Error;

use crate::pool::RunState;

/// Top-level error type for refstream
#[derive(Error, Debug)]
pub enum EngineError {
    /// Worker pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Reference cache errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Local resolution errors
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Interrupted by signal
    #[error("Operation interrupted by signal")]
    Interrupted,
}

/// Worker pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    /// Work item rejected because the pool no longer accepts work
    #[error("Work item rejected: pool is {state}")]
    Rejected { state: RunState },

    /// No worker could be started to process admitted work
    #[error("No worker available: {0}")]
    NoWorkers(#[source] WorkerError),

    /// Pool bounds are inconsistent
    #[error("Invalid pool bounds: core {core}, maximum {max}")]
    InvalidBounds { core: usize, max: usize },
}

/// Worker creation and lifecycle errors
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    /// The worker factory could not produce a handler
    #[error("Failed to create worker {id}: {reason}")]
    CreateFailed { id: usize, reason: String },

    /// The worker thread could not be spawned
    #[error("Failed to spawn worker thread {id}: {reason}")]
    SpawnFailed { id: usize, reason: String },

    /// Worker panicked while processing an item
    #[error("Worker {id} panicked: {message}")]
    Panicked { id: usize, message: String },
}

/// Reference cache and cache table errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection provider could not open a connection
    #[error("Failed to open cache database at '{path}': {reason}")]
    Connect { path: PathBuf, reason: String },

    /// Operation on a table that was already dropped
    #[error("Cache table '{0}' has been dropped")]
    Dropped(String),

    /// Cold lookup on a partition whose heap view was never built
    #[error("Heap view of cache partition {partition} is missing")]
    MissingHeapView { partition: usize },

    /// I/O error while preparing the cache directory
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// A reference chain leads back to one of its own ancestors
    #[error("Circular reference in unit '{unit}': {}", chain.join(" -> "))]
    CircularReference { unit: String, chain: Vec<String> },

    /// Texture coordinate list with an odd number of values
    #[error("Texture coordinates for ring '{ring}' have odd length {len}")]
    OddCoordinateList { ring: String, len: usize },

    /// Texture coordinates for a ring no target has registered
    #[error("Texture coordinates reference unknown ring '{0}'")]
    UnknownRing(String),
}

impl ResolveError {
    /// Check if this error only curtails the current unit
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ResolveError::CircularReference { .. } | ResolveError::UnknownRing(_)
        )
    }
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid pool bounds
    #[error("Invalid pool size: core {core}, maximum {max} (maximum must be 1..={limit} and >= core)")]
    InvalidPoolSize { core: usize, max: usize, limit: usize },

    /// Invalid queue size
    #[error("Invalid queue size {size}: must be at least {min}")]
    InvalidQueueSize { size: usize, min: usize },

    /// Invalid partition count
    #[error("Invalid partition count {count}: must be between 1 and {max}")]
    InvalidPartitions { count: usize, max: usize },

    /// Invalid batch size
    #[error("Invalid batch size {size}: must be between {min} and {max}")]
    InvalidBatchSize { size: usize, min: usize, max: usize },

    /// Invalid drain factor
    #[error("Invalid drain factor {0}: must be in (0, 1]")]
    InvalidDrainFactor(f64),

    /// Invalid cache directory
    #[error("Invalid cache directory '{path}': {reason}")]
    InvalidCacheDir { path: PathBuf, reason: String },
}

/// Result type alias for EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type alias for PoolError
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Result type alias for CacheError
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Result type alias for ResolveError
pub type ResolveResult<T> = std::result::Result<T, ResolveError>;

/// Outcome of processing a single work item, as reported by handlers
#[derive(Debug)]
pub enum WorkOutcome {
    /// Item processed
    Success { key: String },

    /// Item processed partially (e.g. local resolution curtailed)
    Partial { key: String, reason: String },

    /// Item abandoned
    Failed { key: String, reason: String },
}

impl WorkOutcome {
    /// Returns true if this outcome represents success
    pub fn is_success(&self) -> bool {
        matches!(self, WorkOutcome::Success { .. })
    }

    /// Returns the key of the item this outcome belongs to
    pub fn key(&self) -> &str {
        match self {
            WorkOutcome::Success { key } => key,
            WorkOutcome::Partial { key, .. } => key,
            WorkOutcome::Failed { key, .. } => key,
        }
    }
}
