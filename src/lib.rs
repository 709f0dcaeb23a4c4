//! refstream - Worker Pool and Cross-Reference Cache for Streaming Imports
//!
//! The concurrency core of a streaming document importer: one producer reads
//! top-level objects (units) and hands them to a pool of workers, which store
//! them and resolve the id-based references between them.
//!
//! # Features
//!
//! - **Worker Pool**: bounded pool of long-lived worker threads fed through a
//!   single blocking queue, with adaptive shrinking when workers cannot be
//!   created and `join()` barriers between pipeline stages.
//!
//! - **Reference Cache**: concurrent in-memory map backed by partitioned
//!   SQLite tables; drained in batches, read through indexed heap views.
//!
//! - **Per-Key Locks**: one lock per shared row key, scoped per owner type.
//!
//! - **Local Resolvers**: geometry xlinks resolved inside their unit with
//!   cycle detection; texture coordinates assembled per ring.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────┐  add_work   ┌─────────────┐   take   ┌──────────────────┐
//!   │   Producer   │────────────▶│  WorkQueue  │─────────▶│  Worker 1..N     │
//!   │  (document)  │◀── join ────│  (bounded)  │          │  XlinkResolver   │
//!   └──────────────┘             └─────────────┘          │  TexCoordAssembl.│
//!                                                         └───┬─────────┬────┘
//!                                              put / lookup   │         │ lock(key)
//!                                                             ▼         ▼
//!                                  ┌────────────────────────────┐  ┌─────────────┐
//!                                  │      ReferenceCache        │  │ LockManager │
//!                                  │  hot: DashMap              │  └─────────────┘
//!                                  │  cold: N SQLite partitions │
//!                                  │        + heap views        │
//!                                  └────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Import 100k synthetic units with progress
//! refstream --units 100000 -p
//!
//! # Small pool, tiny queue
//! refstream --core-workers 2 --max-workers 4 --queue-size 16
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod lock;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod resolve;

pub use cache::{CacheEntry, ReferenceCache};
pub use config::{CacheConfig, CliArgs, PipelineConfig, PoolConfig, PoolSizeAdaptation};
pub use error::{EngineError, Result};
pub use lock::{LockManager, LockRegistry};
pub use pipeline::{ImportPipeline, ImportResult};
pub use pool::{WorkHandler, WorkerFactory, WorkerPool};
