//! Reference cache and cache tables
//!
//! This module provides:
//! - Cache table shapes and their SQL (`schema`)
//! - Connection providers, tables and branching (`table`)
//! - The two-tier key to id cache (`reference`)
//! - The deferred cross-unit link store (`deferred`)

pub mod deferred;
pub mod reference;
pub mod schema;
pub mod table;

pub use deferred::{DeferredLink, DeferredLinks};
pub use reference::{CacheEntry, CacheStats, ReferenceCache};
pub use schema::CacheTableModel;
pub use table::{CacheTable, CacheTableManager, ConnectionProvider, SqliteProvider};
