//! Cache table shapes and their SQL
//!
//! Every cache table has one of a small, closed set of shapes. Each shape
//! owns its create, index, insert and drop statements so callers select the
//! SQL with a `match` on [`CacheTableModel`] instead of inspecting table
//! objects.

/// SQLite pragmas for cache databases
///
/// Cache tables never outlive one operation, so durability is traded for
/// insert speed.
pub const CACHE_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = OFF;
PRAGMA cache_size = -32000;      -- 32MB cache per connection
PRAGMA temp_store = MEMORY;
PRAGMA auto_vacuum = NONE;
"#;

/// Columns shared by the id table and its heap view
const ID_COLUMNS: &str = "gmlid, id, root_id, reverse, mapping, type_id";

/// Shape of a cache table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTableModel {
    /// Write-optimized id cache rows, unique on gmlid
    Id,

    /// Read-optimized copy of an id table, indexed by gmlid
    IdHeap,

    /// Cross-unit references waiting for the resolve stage
    DeferredLink,
}

impl CacheTableModel {
    /// Prefix for generated table names
    pub fn prefix(&self) -> &'static str {
        match self {
            CacheTableModel::Id => "tmp_id",
            CacheTableModel::IdHeap => "tmp_id_heap",
            CacheTableModel::DeferredLink => "tmp_link",
        }
    }

    /// SQL to create an empty table of this shape
    pub fn create_sql(&self, name: &str) -> String {
        match self {
            CacheTableModel::Id | CacheTableModel::IdHeap => format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    gmlid TEXT NOT NULL UNIQUE,
                    id INTEGER NOT NULL,
                    root_id INTEGER NOT NULL,
                    reverse INTEGER NOT NULL DEFAULT 0,  -- 0=forward, 1=reverse
                    mapping TEXT,
                    type_id INTEGER NOT NULL
                )"
            ),
            CacheTableModel::DeferredLink => format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    seq INTEGER PRIMARY KEY,
                    from_id INTEGER NOT NULL,
                    from_table TEXT NOT NULL,
                    from_column TEXT NOT NULL,
                    target TEXT NOT NULL
                )"
            ),
        }
    }

    /// SQL to create this shape as a copy of `source`, if the shape
    /// supports being materialized from another table
    pub fn create_as_copy_sql(&self, name: &str, source: &str) -> Option<String> {
        match self {
            CacheTableModel::IdHeap => Some(format!(
                "CREATE TABLE {name} AS SELECT {ID_COLUMNS} FROM {source}"
            )),
            CacheTableModel::Id | CacheTableModel::DeferredLink => None,
        }
    }

    /// Index statements applied after the table is populated
    pub fn index_sql(&self, name: &str) -> Vec<String> {
        match self {
            CacheTableModel::IdHeap => vec![format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_{name}_gmlid ON {name}(gmlid)"
            )],
            CacheTableModel::Id | CacheTableModel::DeferredLink => Vec::new(),
        }
    }

    /// SQL to insert one row
    ///
    /// Id rows keep the first definition of a gmlid; later ones are ignored.
    pub fn insert_sql(&self, name: &str) -> String {
        match self {
            CacheTableModel::Id | CacheTableModel::IdHeap => format!(
                "INSERT OR IGNORE INTO {name} ({ID_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            CacheTableModel::DeferredLink => format!(
                "INSERT INTO {name} (from_id, from_table, from_column, target) VALUES (?1, ?2, ?3, ?4)"
            ),
        }
    }

    /// SQL to look up rows by key
    pub fn select_sql(&self, name: &str) -> String {
        match self {
            CacheTableModel::Id | CacheTableModel::IdHeap => format!(
                "SELECT id, root_id, reverse, mapping, type_id FROM {name} WHERE gmlid = ?1 LIMIT 1"
            ),
            CacheTableModel::DeferredLink => format!(
                "SELECT seq, from_id, from_table, from_column, target FROM {name}
                 WHERE seq > ?1 ORDER BY seq LIMIT ?2"
            ),
        }
    }

    /// SQL to remove every row
    pub fn truncate_sql(&self, name: &str) -> String {
        format!("DELETE FROM {name}")
    }

    /// SQL to drop the table
    pub fn drop_sql(&self, name: &str) -> String {
        format!("DROP TABLE IF EXISTS {name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn test_create_every_model() {
        let conn = Connection::open_in_memory().unwrap();

        for (model, name) in [
            (CacheTableModel::Id, "t_id"),
            (CacheTableModel::IdHeap, "t_heap"),
            (CacheTableModel::DeferredLink, "t_link"),
        ] {
            conn.execute(&model.create_sql(name), []).unwrap();
            for sql in model.index_sql(name) {
                conn.execute(&sql, []).unwrap();
            }
            assert!(table_exists(&conn, name));

            conn.execute(&model.drop_sql(name), []).unwrap();
            assert!(!table_exists(&conn, name));
        }
    }

    #[test]
    fn test_heap_copy_is_indexed() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(&CacheTableModel::Id.create_sql("src"), []).unwrap();
        conn.execute(
            &CacheTableModel::Id.insert_sql("src"),
            rusqlite::params!["gml_1", 10, 1, 0, Option::<String>::None, 26],
        )
        .unwrap();

        let heap = CacheTableModel::IdHeap;
        conn.execute(&heap.create_as_copy_sql("heap", "src").unwrap(), [])
            .unwrap();
        for sql in heap.index_sql("heap") {
            conn.execute(&sql, []).unwrap();
        }

        let id: i64 = conn
            .query_row(&heap.select_sql("heap"), ["gml_1"], |row| row.get(0))
            .unwrap();
        assert_eq!(id, 10);

        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND tbl_name='heap'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 1);
    }

    #[test]
    fn test_id_rows_keep_first_definition() {
        let conn = Connection::open_in_memory().unwrap();

        for (model, name) in [(CacheTableModel::Id, "ids"), (CacheTableModel::IdHeap, "heap")] {
            conn.execute(&model.create_sql(name), []).unwrap();
            for sql in model.index_sql(name) {
                conn.execute(&sql, []).unwrap();
            }

            let insert = model.insert_sql(name);
            let first = conn
                .execute(&insert, rusqlite::params!["gml_1", 10, 1, 0, Option::<String>::None, 26])
                .unwrap();
            let second = conn
                .execute(&insert, rusqlite::params!["gml_1", 20, 2, 1, Option::<String>::None, 26])
                .unwrap();
            assert_eq!((first, second), (1, 0));

            let (rows, id): (i64, i64) = conn
                .query_row(&format!("SELECT COUNT(*), MIN(id) FROM {name}"), [], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .unwrap();
            assert_eq!((rows, id), (1, 10));
        }
    }

    #[test]
    fn test_only_heap_supports_copy() {
        assert!(CacheTableModel::Id.create_as_copy_sql("a", "b").is_none());
        assert!(CacheTableModel::DeferredLink
            .create_as_copy_sql("a", "b")
            .is_none());
    }
}
