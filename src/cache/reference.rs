//! Two-tier reference cache
//!
//! Maps symbolic keys (gml ids) to the database identity of the object that
//! defined them. New entries land in a concurrent in-memory map (the hot
//! tier). When the hot tier reaches its capacity, part of it is drained to
//! the cold tier: N SQLite partitions chosen by key hash, each with its own
//! connection, written in batched transactions.
//!
//! Cold lookups go through a per-partition heap view, an indexed copy of the
//! partition table built once on the first cold lookup.

use crate::cache::schema::CacheTableModel;
use crate::cache::table::{CacheTable, CacheTableManager};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Database identity registered for a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Database id of the object
    pub id: i64,

    /// Id of the top-level object containing it
    pub root_id: i64,

    /// Object is referenced with reversed orientation
    pub reverse: bool,

    /// Optional mapping target (texture image, appearance target)
    pub mapping: Option<String>,

    /// Object class id
    pub type_id: i32,
}

impl CacheEntry {
    pub fn new(id: i64, root_id: i64, type_id: i32) -> Self {
        Self {
            id,
            root_id,
            reverse: false,
            mapping: None,
            type_id,
        }
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_mapping(mut self, mapping: impl Into<String>) -> Self {
        self.mapping = Some(mapping.into());
        self
    }
}

/// Counters for cache activity
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Entries accepted by `put`
    pub puts: AtomicU64,

    /// `put` calls ignored because the key was already registered
    pub duplicates: AtomicU64,

    /// Entries moved to the cold tier
    pub drained: AtomicU64,

    /// Automatic drains triggered by reaching capacity
    pub auto_drains: AtomicU64,

    /// Lookups answered by the hot tier
    pub hot_hits: AtomicU64,

    /// Lookups answered by a heap view
    pub cold_hits: AtomicU64,

    /// Lookups that found nothing
    pub misses: AtomicU64,
}

impl CacheStats {
    pub fn drained(&self) -> u64 {
        self.drained.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hot_hits.load(Ordering::Relaxed) + self.cold_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// One shard of the cold tier
struct CachePartition {
    index: usize,
    table: CacheTable,

    /// Indexed copy of `table`, set once by the heap build
    heap: OnceCell<CacheTable>,
}

impl CachePartition {
    /// Insert a batch in one transaction, mirroring it into the heap view
    /// if that was already built
    fn insert_batch(&self, batch: &[(String, CacheEntry)]) -> CacheResult<()> {
        let heap = self.heap.get();
        let table_sql = self.table.model().insert_sql(self.table.name());
        let heap_sql = heap.map(|h| h.model().insert_sql(h.name()));

        self.table.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&table_sql)?;
                for (key, e) in batch {
                    stmt.execute(params![key, e.id, e.root_id, e.reverse, e.mapping, e.type_id])?;
                }

                if let Some(heap_sql) = &heap_sql {
                    let mut stmt = tx.prepare_cached(heap_sql)?;
                    for (key, e) in batch {
                        stmt.execute(params![
                            key, e.id, e.root_id, e.reverse, e.mapping, e.type_id
                        ])?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Read `key` from the heap view
    fn lookup(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let heap = self
            .heap
            .get()
            .ok_or(CacheError::MissingHeapView { partition: self.index })?;
        Self::select(heap, key)
    }

    /// Check the partition table itself, whether or not the heap view exists
    fn contains(&self, key: &str) -> CacheResult<bool> {
        Ok(Self::select(&self.table, key)?.is_some())
    }

    fn select(table: &CacheTable, key: &str) -> CacheResult<Option<CacheEntry>> {
        let sql = table.model().select_sql(table.name());

        table.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let entry = stmt
                .query_row([key], |row| {
                    Ok(CacheEntry {
                        id: row.get(0)?,
                        root_id: row.get(1)?,
                        reverse: row.get(2)?,
                        mapping: row.get(3)?,
                        type_id: row.get(4)?,
                    })
                })
                .optional()?;
            Ok(entry)
        })
    }
}

/// Hot map plus partitioned, SQLite-backed cold tier
pub struct ReferenceCache {
    hot: DashMap<String, CacheEntry>,
    partitions: Vec<CachePartition>,
    config: CacheConfig,

    /// Serializes drains, truncation and the heap build
    drain_lock: Mutex<()>,

    /// Set once every partition has its heap view
    heap_built: OnceCell<()>,

    /// Something reached the cold tier since creation or the last truncate
    persisted: AtomicBool,

    dropped: AtomicBool,
    stats: CacheStats,
}

impl ReferenceCache {
    /// Create a cache with one table per partition, each on its own
    /// connection from `manager`
    pub fn new(manager: &CacheTableManager, config: &CacheConfig) -> CacheResult<Self> {
        let partitions = (0..config.partitions.max(1))
            .map(|index| {
                Ok(CachePartition {
                    index,
                    table: manager.create_table(CacheTableModel::Id)?,
                    heap: OnceCell::new(),
                })
            })
            .collect::<CacheResult<Vec<_>>>()?;

        debug!(
            partitions = partitions.len(),
            capacity = config.capacity,
            drain_size = config.drain_size(),
            "Created reference cache"
        );

        Ok(Self {
            hot: DashMap::new(),
            partitions,
            config: config.clone(),
            drain_lock: Mutex::new(()),
            heap_built: OnceCell::new(),
            persisted: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
            stats: CacheStats::default(),
        })
    }

    /// Register `entry` under `key`
    ///
    /// The first definition of a key wins, in either tier; later ones are
    /// ignored and `false` is returned. Reaching the hot-tier capacity
    /// triggers an automatic drain in whichever caller wins the drain lock.
    pub fn put(&self, key: impl Into<String>, entry: CacheEntry) -> CacheResult<bool> {
        self.check_live()?;

        let inserted = match self.hot.entry(key.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                // Drains commit before removing keys, so a key missing from
                // the hot tier while this slot is held is either new or on disk
                let on_disk = self.persisted.load(Ordering::SeqCst)
                    && self.partitions[self.partition_of(slot.key())].contains(slot.key())?;
                if on_disk {
                    false
                } else {
                    slot.insert(entry);
                    true
                }
            }
        };

        if !inserted {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        self.stats.puts.fetch_add(1, Ordering::Relaxed);

        if self.hot.len() >= self.config.capacity {
            if let Some(_guard) = self.drain_lock.try_lock() {
                let drained = self.drain_locked(self.config.drain_size())?;
                self.stats.auto_drains.fetch_add(1, Ordering::Relaxed);
                debug!(drained, hot = self.hot.len(), "Automatic cache drain");
            }
        }

        Ok(true)
    }

    /// Look up `key`, hot tier first
    ///
    /// The first lookup that has to consult the cold tier builds every
    /// partition's heap view; concurrent callers wait for that build.
    pub fn lookup(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        self.check_live()?;

        if let Some(entry) = self.hot.get(key) {
            self.stats.hot_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entry.value().clone()));
        }

        if !self.persisted.load(Ordering::SeqCst) {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.ensure_heap_views()?;
        let found = self.partitions[self.partition_of(key)].lookup(key)?;

        match &found {
            Some(_) => self.stats.cold_hits.fetch_add(1, Ordering::Relaxed),
            None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(found)
    }

    /// Move up to `n` hot entries to the cold tier
    ///
    /// Returns the number of entries moved. Entries leave the hot tier only
    /// after their batch was committed.
    pub fn drain(&self, n: usize) -> CacheResult<usize> {
        self.check_live()?;
        let _guard = self.drain_lock.lock();
        self.drain_locked(n)
    }

    /// Move every hot entry to the cold tier
    pub fn drain_all(&self) -> CacheResult<usize> {
        let mut total = 0;
        loop {
            let drained = self.drain(self.config.batch_size.saturating_mul(self.partitions.len()))?;
            if drained == 0 {
                return Ok(total);
            }
            total += drained;
        }
    }

    fn drain_locked(&self, n: usize) -> CacheResult<usize> {
        if n == 0 {
            return Ok(0);
        }

        let snapshot: Vec<(String, CacheEntry)> = self
            .hot
            .iter()
            .take(n)
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();

        let mut batches: Vec<Vec<(String, CacheEntry)>> =
            (0..self.partitions.len()).map(|_| Vec::new()).collect();
        let mut drained = 0;

        for (key, entry) in snapshot {
            let index = self.partition_of(&key);
            batches[index].push((key, entry));

            if batches[index].len() >= self.config.batch_size {
                let batch = std::mem::take(&mut batches[index]);
                drained += self.flush_batch(index, batch)?;
            }
        }

        for (index, batch) in batches.into_iter().enumerate() {
            if !batch.is_empty() {
                drained += self.flush_batch(index, batch)?;
            }
        }

        self.stats.drained.fetch_add(drained as u64, Ordering::Relaxed);
        Ok(drained)
    }

    fn flush_batch(&self, index: usize, batch: Vec<(String, CacheEntry)>) -> CacheResult<usize> {
        let partition = &self.partitions[index];
        partition.insert_batch(&batch)?;

        // Must be visible before the keys leave the hot tier
        self.persisted.store(true, Ordering::SeqCst);
        for (key, _) in &batch {
            self.hot.remove(key);
        }

        trace!(partition = partition.index, rows = batch.len(), "Flushed cache batch");
        Ok(batch.len())
    }

    fn ensure_heap_views(&self) -> CacheResult<()> {
        self.heap_built.get_or_try_init(|| -> CacheResult<()> {
            let _guard = self.drain_lock.lock();
            let start = Instant::now();

            for partition in &self.partitions {
                if partition.heap.get().is_none() {
                    let heap = partition.table.branch_copy(CacheTableModel::IdHeap)?;
                    let _ = partition.heap.set(heap);
                }
            }

            info!(
                partitions = self.partitions.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Built reference cache heap views"
            );
            Ok(())
        })?;
        Ok(())
    }

    fn partition_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    fn check_live(&self) -> CacheResult<()> {
        if self.dropped.load(Ordering::SeqCst) {
            return Err(CacheError::Dropped(self.table_name().to_string()));
        }
        Ok(())
    }

    /// Name of the table backing the first partition
    pub fn table_name(&self) -> &str {
        self.partitions[0].table.name()
    }

    /// Names of every partition table
    pub fn table_names(&self) -> Vec<&str> {
        self.partitions.iter().map(|p| p.table.name()).collect()
    }

    /// Clear both tiers, keeping the tables
    pub fn truncate(&self) -> CacheResult<()> {
        self.check_live()?;
        let _guard = self.drain_lock.lock();

        self.hot.clear();
        for partition in &self.partitions {
            partition.table.truncate()?;
            if let Some(heap) = partition.heap.get() {
                heap.truncate()?;
            }
        }
        self.persisted.store(false, Ordering::SeqCst);

        debug!(table = self.table_name(), "Truncated reference cache");
        Ok(())
    }

    /// Drop every partition table and its heap view
    ///
    /// All partitions are attempted; the first failure is returned.
    pub fn drop_tables(&self) -> CacheResult<()> {
        if self.dropped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.drain_lock.lock();
        self.hot.clear();

        let mut first_error = None;
        for partition in &self.partitions {
            if let Err(e) = partition.table.drop_table() {
                warn!(partition = partition.index, error = %e, "Failed to drop cache table");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!(partitions = self.partitions.len(), "Dropped reference cache tables");
                Ok(())
            }
        }
    }

    /// Entries currently in the hot tier
    pub fn hot_len(&self) -> usize {
        self.hot.len()
    }

    /// Rows persisted across all partition tables
    pub fn persisted_len(&self) -> CacheResult<u64> {
        self.check_live()?;
        self.partitions
            .iter()
            .map(|p| p.table.row_count())
            .sum()
    }

    /// Number of partitions
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Check if the heap views were built
    pub fn heap_views_built(&self) -> bool {
        self.heap_built.get().is_some()
    }

    /// Activity counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl Drop for ReferenceCache {
    fn drop(&mut self) {
        if let Err(e) = self.drop_tables() {
            warn!(error = %e, "Failed to drop reference cache tables");
        }
    }
}
