//! Cache tables and the connections behind them
//!
//! A [`ConnectionProvider`] hands out raw SQLite connections. The
//! [`CacheTableManager`] pairs every new table with its own connection, so
//! two tables created by the manager never contend for the same handle.
//! Branches of a table live on the parent's connection and are dropped with
//! it.

use crate::cache::schema::{CacheTableModel, CACHE_PRAGMAS};
use crate::error::{CacheError, CacheResult};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::debug;

/// How long a connection waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of raw database connections for cache tables
pub trait ConnectionProvider: Send + Sync {
    /// Open a fresh connection
    fn connect(&self) -> CacheResult<Connection>;
}

/// File-backed SQLite provider
///
/// Every connection gets its own database file inside the cache directory,
/// so writers on different connections never serialize on SQLite's
/// database-level lock.
pub struct SqliteProvider {
    dir: PathBuf,

    /// Keeps a temporary directory alive until the provider is dropped
    _temp: Option<TempDir>,

    next_file: AtomicUsize,
}

impl SqliteProvider {
    /// Use an existing directory for cache databases
    pub fn new(dir: &Path) -> CacheResult<Self> {
        if !dir.is_dir() {
            return Err(CacheError::Connect {
                path: dir.to_path_buf(),
                reason: "Not an existing directory".to_string(),
            });
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            _temp: None,
            next_file: AtomicUsize::new(0),
        })
    }

    /// Use a temporary directory removed when the provider is dropped
    pub fn temporary() -> CacheResult<Self> {
        let temp = tempfile::Builder::new().prefix("refstream-cache-").tempdir()?;
        debug!(dir = %temp.path().display(), "Created temporary cache directory");

        Ok(Self {
            dir: temp.path().to_path_buf(),
            _temp: Some(temp),
            next_file: AtomicUsize::new(0),
        })
    }

    /// Directory holding the cache databases
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ConnectionProvider for SqliteProvider {
    fn connect(&self) -> CacheResult<Connection> {
        let n = self.next_file.fetch_add(1, Ordering::SeqCst);
        let path = self.dir.join(format!("cache_{:04}.db", n));

        let conn = Connection::open(&path).map_err(|e| CacheError::Connect {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        conn.execute_batch(CACHE_PRAGMAS)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        Ok(conn)
    }
}

/// One cache table bound to a connection
pub struct CacheTable {
    name: String,
    model: CacheTableModel,
    conn: Arc<Mutex<Connection>>,

    /// Names of sibling tables created on the same connection
    branches: Mutex<Vec<String>>,

    dropped: AtomicBool,
}

impl CacheTable {
    /// Create an empty table on `conn`
    pub(crate) fn create(
        conn: Arc<Mutex<Connection>>,
        model: CacheTableModel,
        name: String,
    ) -> CacheResult<Self> {
        {
            let guard = conn.lock();
            guard.execute(&model.create_sql(&name), [])?;
        }

        Ok(Self::wrap(conn, model, name))
    }

    fn wrap(conn: Arc<Mutex<Connection>>, model: CacheTableModel, name: String) -> Self {
        Self {
            name,
            model,
            conn,
            branches: Mutex::new(Vec::new()),
            dropped: AtomicBool::new(false),
        }
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table shape
    pub fn model(&self) -> CacheTableModel {
        self.model
    }

    /// Check if the table was dropped
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Run `f` with exclusive access to this table's connection
    pub fn with_conn<R>(&self, f: impl FnOnce(&mut Connection) -> CacheResult<R>) -> CacheResult<R> {
        if self.is_dropped() {
            return Err(CacheError::Dropped(self.name.clone()));
        }
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    /// Create an empty sibling table of shape `model` on the same connection
    pub fn branch(&self, model: CacheTableModel) -> CacheResult<CacheTable> {
        self.create_branch(model, false)
    }

    /// Create a sibling table of shape `model` holding a copy of this
    /// table's rows, indexed after the copy
    ///
    /// Shapes that cannot be copied into get an empty branch.
    pub fn branch_copy(&self, model: CacheTableModel) -> CacheResult<CacheTable> {
        self.create_branch(model, true)
    }

    fn create_branch(&self, model: CacheTableModel, copy: bool) -> CacheResult<CacheTable> {
        let name = self.next_branch_name(model);
        let create_sql = match model.create_as_copy_sql(&name, &self.name) {
            Some(sql) if copy => sql,
            _ => model.create_sql(&name),
        };

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(&create_sql, [])?;
            for sql in model.index_sql(&name) {
                tx.execute(&sql, [])?;
            }
            tx.commit()?;
            Ok(())
        })?;

        debug!(source = %self.name, branch = %name, copy, "Created branch table");
        Ok(CacheTable::wrap(Arc::clone(&self.conn), model, name))
    }

    /// Reserve a branch name; reserved names are dropped with the parent
    /// even if creating the branch failed
    fn next_branch_name(&self, model: CacheTableModel) -> String {
        let mut branches = self.branches.lock();
        let name = format!("{}_{}_{}", self.name, model.prefix(), branches.len());
        branches.push(name.clone());
        name
    }

    /// Number of rows in the table
    pub fn row_count(&self) -> CacheResult<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.name), [], |row| {
                    row.get(0)
                })?;
            Ok(count as u64)
        })
    }

    /// Remove every row, keeping the table and its branches
    pub fn truncate(&self) -> CacheResult<()> {
        self.with_conn(|conn| {
            conn.execute(&self.model.truncate_sql(&self.name), [])?;
            Ok(())
        })
    }

    /// Drop the table and every branch created from it
    ///
    /// Dropping twice is a no-op.
    pub fn drop_table(&self) -> CacheResult<()> {
        if self.dropped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let branches = std::mem::take(&mut *self.branches.lock());
        let conn = self.conn.lock();
        for branch in &branches {
            conn.execute(&format!("DROP TABLE IF EXISTS {}", branch), [])?;
        }
        conn.execute(&self.model.drop_sql(&self.name), [])?;

        debug!(table = %self.name, branches = branches.len(), "Dropped cache table");
        Ok(())
    }
}

impl std::fmt::Debug for CacheTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheTable")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("dropped", &self.is_dropped())
            .finish()
    }
}

/// Creates cache tables with unique names, one connection each
pub struct CacheTableManager {
    provider: Arc<dyn ConnectionProvider>,
    next_table: AtomicUsize,
}

impl CacheTableManager {
    /// Create a manager over `provider`
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            next_table: AtomicUsize::new(0),
        }
    }

    /// Create a manager over a temporary SQLite directory
    pub fn temporary() -> CacheResult<Self> {
        Ok(Self::new(Arc::new(SqliteProvider::temporary()?)))
    }

    /// Create an empty table of shape `model` on a fresh connection
    pub fn create_table(&self, model: CacheTableModel) -> CacheResult<CacheTable> {
        let n = self.next_table.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}_{}", model.prefix(), n);
        let conn = self.provider.connect()?;

        CacheTable::create(Arc::new(Mutex::new(conn)), model, name)
    }

    /// Number of tables created so far
    pub fn tables_created(&self) -> usize {
        self.next_table.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;
    use tempfile::tempdir;

    fn table_exists(table: &CacheTable, name: &str) -> bool {
        table
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [name],
                |row| row.get::<_, i64>(0),
            )
            .unwrap()
            == 1
    }

    fn insert(table: &CacheTable, key: &str, id: i64) {
        table
            .with_conn(|conn| {
                conn.execute(
                    &table.model().insert_sql(table.name()),
                    params![key, id, id, 0, Option::<String>::None, 1],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_provider_rejects_missing_dir() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            SqliteProvider::new(&missing),
            Err(CacheError::Connect { .. })
        ));
    }

    #[test]
    fn test_provider_one_file_per_connection() {
        let dir = tempdir().unwrap();
        let provider = SqliteProvider::new(dir.path()).unwrap();

        let _a = provider.connect().unwrap();
        let _b = provider.connect().unwrap();

        assert!(dir.path().join("cache_0000.db").exists());
        assert!(dir.path().join("cache_0001.db").exists());
    }

    #[test]
    fn test_temporary_provider_cleans_up() {
        let provider = SqliteProvider::temporary().unwrap();
        let dir = provider.dir().to_path_buf();
        provider.connect().unwrap();
        assert!(dir.exists());

        drop(provider);
        assert!(!dir.exists());
    }

    #[test]
    fn test_manager_unique_names() {
        let manager = CacheTableManager::temporary().unwrap();
        let a = manager.create_table(CacheTableModel::Id).unwrap();
        let b = manager.create_table(CacheTableModel::Id).unwrap();

        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("tmp_id_"));
        assert_eq!(manager.tables_created(), 2);
    }

    #[test]
    fn test_truncate_and_row_count() {
        let manager = CacheTableManager::temporary().unwrap();
        let table = manager.create_table(CacheTableModel::Id).unwrap();

        insert(&table, "a", 1);
        insert(&table, "b", 2);
        assert_eq!(table.row_count().unwrap(), 2);

        table.truncate().unwrap();
        assert_eq!(table.row_count().unwrap(), 0);
    }

    #[test]
    fn test_branch_copy_holds_rows() {
        let manager = CacheTableManager::temporary().unwrap();
        let table = manager.create_table(CacheTableModel::Id).unwrap();
        insert(&table, "a", 1);
        insert(&table, "b", 2);

        let heap = table.branch_copy(CacheTableModel::IdHeap).unwrap();
        assert_eq!(heap.model(), CacheTableModel::IdHeap);
        assert_eq!(heap.row_count().unwrap(), 2);

        // Later writes to the parent are not mirrored
        insert(&table, "c", 3);
        assert_eq!(heap.row_count().unwrap(), 2);
    }

    #[test]
    fn test_drop_removes_branches() {
        let manager = CacheTableManager::temporary().unwrap();
        let table = manager.create_table(CacheTableModel::Id).unwrap();
        let heap = table.branch_copy(CacheTableModel::IdHeap).unwrap();
        let empty = table.branch(CacheTableModel::Id).unwrap();

        assert!(table_exists(&table, heap.name()));
        assert!(table_exists(&table, empty.name()));

        table.drop_table().unwrap();
        assert!(table.is_dropped());
        assert!(!table_exists(&heap, table.name()));
        assert!(!table_exists(&heap, heap.name()));
        assert!(!table_exists(&heap, empty.name()));

        // Second drop is a no-op, further use is an error
        table.drop_table().unwrap();
        assert!(matches!(table.row_count(), Err(CacheError::Dropped(_))));
    }
}
