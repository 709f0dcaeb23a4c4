//! Deferred cross-unit references
//!
//! A worker that cannot resolve a reference inside its own unit records it
//! here. Records are buffered in memory and appended to a `DeferredLink`
//! cache table in batches; the resolve stage reads them back in sequence
//! order once every unit has been imported.

use crate::cache::schema::CacheTableModel;
use crate::cache::table::{CacheTable, CacheTableManager};
use crate::error::CacheResult;
use parking_lot::Mutex;
use rusqlite::params;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// A reference waiting for its target to be registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredLink {
    /// Database id of the referring object
    pub from_id: i64,

    /// Table holding the referring object
    pub from_table: String,

    /// Column to fill with the target id
    pub from_column: String,

    /// Key of the referenced object
    pub target: String,
}

impl DeferredLink {
    pub fn new(
        from_id: i64,
        from_table: impl Into<String>,
        from_column: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            from_id,
            from_table: from_table.into(),
            from_column: from_column.into(),
            target: target.into(),
        }
    }
}

/// Append-only store of deferred links
pub struct DeferredLinks {
    table: CacheTable,
    buffer: Mutex<Vec<DeferredLink>>,
    batch_size: usize,
    written: AtomicU64,
}

impl DeferredLinks {
    /// Create the backing table on a fresh connection from `manager`
    pub fn new(manager: &CacheTableManager, batch_size: usize) -> CacheResult<Self> {
        let table = manager.create_table(CacheTableModel::DeferredLink)?;
        Ok(Self {
            table,
            buffer: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
            written: AtomicU64::new(0),
        })
    }

    /// Record a link, writing the buffer once it holds a full batch
    pub fn push(&self, link: DeferredLink) -> CacheResult<()> {
        let batch = {
            let mut buffer = self.buffer.lock();
            buffer.push(link);
            if buffer.len() < self.batch_size {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };

        self.write_batch(&batch)
    }

    /// Write any buffered links
    pub fn flush(&self) -> CacheResult<()> {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return Ok(());
        }
        self.write_batch(&batch)
    }

    fn write_batch(&self, batch: &[DeferredLink]) -> CacheResult<()> {
        let sql = self.table.model().insert_sql(self.table.name());

        self.table.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for link in batch {
                    stmt.execute(params![
                        link.from_id,
                        link.from_table,
                        link.from_column,
                        link.target
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;

        self.written.fetch_add(batch.len() as u64, Ordering::Relaxed);
        trace!(rows = batch.len(), table = %self.table.name(), "Wrote deferred links");
        Ok(())
    }

    /// Read up to `limit` persisted links with a sequence number above
    /// `after`, in sequence order
    ///
    /// Pass the last returned sequence number to continue.
    pub fn read_batch(&self, after: i64, limit: usize) -> CacheResult<Vec<(i64, DeferredLink)>> {
        let sql = self.table.model().select_sql(self.table.name());

        self.table.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![after, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    DeferredLink {
                        from_id: row.get(1)?,
                        from_table: row.get(2)?,
                        from_column: row.get(3)?,
                        target: row.get(4)?,
                    },
                ))
            })?;

            let mut links = Vec::new();
            for row in rows {
                links.push(row?);
            }
            Ok(links)
        })
    }

    /// Feed every persisted link to `f` in batches of `limit`
    ///
    /// Stops at the first error returned by `f`.
    pub fn for_each_batch<E>(
        &self,
        limit: usize,
        mut f: impl FnMut(Vec<DeferredLink>) -> Result<(), E>,
    ) -> Result<u64, E>
    where
        E: From<crate::error::CacheError>,
    {
        let mut after = 0;
        let mut total = 0;

        loop {
            let batch = self.read_batch(after, limit.max(1))?;
            let Some((last, _)) = batch.last() else {
                debug!(total, "Read back deferred links");
                return Ok(total);
            };
            after = *last;
            total += batch.len() as u64;
            f(batch.into_iter().map(|(_, link)| link).collect())?;
        }
    }

    /// Links handed to `push`, written or still buffered
    pub fn len(&self) -> u64 {
        self.written.load(Ordering::Relaxed) + self.buffer.lock().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the backing table
    pub fn table_name(&self) -> &str {
        self.table.name()
    }

    /// Drop the backing table, discarding buffered links
    pub fn drop_table(&self) -> CacheResult<()> {
        self.buffer.lock().clear();
        self.table.drop_table()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;

    fn link(i: i64) -> DeferredLink {
        DeferredLink::new(i, "surface_geometry", "parent_id", format!("target_{}", i))
    }

    #[test]
    fn test_push_buffers_until_batch() {
        let manager = CacheTableManager::temporary().unwrap();
        let links = DeferredLinks::new(&manager, 3).unwrap();

        links.push(link(1)).unwrap();
        links.push(link(2)).unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.read_batch(0, 10).unwrap().is_empty());

        links.push(link(3)).unwrap();
        assert_eq!(links.read_batch(0, 10).unwrap().len(), 3);
    }

    #[test]
    fn test_read_back_in_order() {
        let manager = CacheTableManager::temporary().unwrap();
        let links = DeferredLinks::new(&manager, 4).unwrap();

        for i in 0..10 {
            links.push(link(i)).unwrap();
        }
        links.flush().unwrap();

        let mut seen = Vec::new();
        let total = links
            .for_each_batch(3, |batch| -> Result<(), CacheError> {
                assert!(batch.len() <= 3);
                seen.extend(batch.into_iter().map(|l| l.from_id));
                Ok(())
            })
            .unwrap();

        assert_eq!(total, 10);
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_fields_round_trip() {
        let manager = CacheTableManager::temporary().unwrap();
        let links = DeferredLinks::new(&manager, 1).unwrap();

        let original = DeferredLink::new(77, "appearance", "surface_id", "poly_9");
        links.push(original.clone()).unwrap();

        let read = links.read_batch(0, 1).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].1, original);
    }

    #[test]
    fn test_drop_table() {
        let manager = CacheTableManager::temporary().unwrap();
        let links = DeferredLinks::new(&manager, 10).unwrap();
        links.push(link(1)).unwrap();

        links.drop_table().unwrap();
        assert!(matches!(links.read_batch(0, 1), Err(CacheError::Dropped(_))));
    }
}
