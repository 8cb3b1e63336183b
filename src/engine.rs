//! Process-wide engine state (spec §5/§9): the single database connection,
//! the tracked-model registry, the listening flag, and local node identity.
//!
//! Mirrors the original's module-level globals (`set_engine`/`get_engine`,
//! `synched_models`, `listening`) but collapsed into one `Engine` behind a
//! single `RwLock<Option<Arc<Engine>>>`, since Rust has no implicit
//! module-level mutable state. `set_engine` and `drop_all` are the explicit
//! init/teardown hooks; everything else in the crate reaches the database
//! through `get_engine()` rather than holding its own reference.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rusqlite::{Connection, OptionalExtension};

use crate::dialect::Dialect;
use crate::error::{Result, SyncError};
use crate::extensions::ExtensionRegistry;
use crate::registry::{Direction, Registry, TrackedTable};

static ENGINE: RwLock<Option<Arc<Engine>>> = RwLock::new(None);

/// The live engine: one database connection, the model registry, the
/// extension registry, and the listening flag.
pub struct Engine {
    conn: Mutex<Connection>,
    dialect: Box<dyn Dialect>,
    registry: RwLock<Registry>,
    extensions: RwLock<ExtensionRegistry>,
    listening: AtomicBool,
}

impl Engine {
    fn new(conn: Connection, dialect: Box<dyn Dialect>) -> Self {
        Engine {
            conn: Mutex::new(conn),
            dialect,
            registry: RwLock::new(Registry::new()),
            extensions: RwLock::new(ExtensionRegistry::new()),
            listening: AtomicBool::new(true),
        }
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS sync_content_types (
                content_type_id INTEGER PRIMARY KEY,
                table_name TEXT NOT NULL,
                model_name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS sync_nodes (
                node_id INTEGER PRIMARY KEY AUTOINCREMENT,
                registered TEXT NOT NULL,
                registry_user_id INTEGER,
                secret TEXT NOT NULL,
                last_seen_version_id INTEGER
            );

            CREATE TABLE IF NOT EXISTS sync_versions (
                version_id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER,
                created TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_operations (
                \"order\" INTEGER PRIMARY KEY AUTOINCREMENT,
                row_id INTEGER NOT NULL,
                content_type_id INTEGER NOT NULL,
                command TEXT NOT NULL,
                version_id INTEGER REFERENCES sync_versions(version_id)
            );

            CREATE INDEX IF NOT EXISTS ix_sync_operations_row
                ON sync_operations(content_type_id, row_id);

            CREATE TABLE IF NOT EXISTS sync_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created TEXT NOT NULL,
                source TEXT NOT NULL,
                error TEXT NOT NULL,
                node_id INTEGER
            );

            CREATE TABLE IF NOT EXISTS sync_identity (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                node_id INTEGER NOT NULL,
                secret TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Registers a tracked table and records its content-type row. Safe to
    /// call repeatedly; the content-type id is deterministic so the insert
    /// is idempotent.
    pub fn register_model(&self, table: Arc<dyn TrackedTable>, direction: Direction) -> Result<()> {
        let ct = crate::registry::content_type_id(table.model_name(), table.table_name());
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR IGNORE INTO sync_content_types (content_type_id, table_name, model_name)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![ct, table.table_name(), table.model_name()],
            )?;
        }
        self.registry.write().unwrap().register(table, direction);
        Ok(())
    }

    pub fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap()
    }

    pub fn extensions(&self) -> RwLockReadGuard<'_, ExtensionRegistry> {
        self.extensions.read().unwrap()
    }

    pub fn extensions_mut(&self) -> RwLockWriteGuard<'_, ExtensionRegistry> {
        self.extensions.write().unwrap()
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    /// Whether a specific row has no pending (unversioned) change: true if
    /// it has never been logged at all, or its most recent logged
    /// operation already carries a `version_id`. Errors if `model_name`
    /// isn't a registered tracked model.
    pub fn is_synced(&self, model_name: &str, pk: i64) -> Result<bool> {
        let content_type_id = self
            .registry()
            .content_type_id_of(model_name)
            .ok_or(SyncError::State("is_synced: model isn't tracked"))?;
        let conn = self.conn.lock().unwrap();
        let version_id: Option<Option<i64>> = conn
            .query_row(
                "SELECT version_id FROM sync_operations
                 WHERE content_type_id = ?1 AND row_id = ?2 ORDER BY \"order\" DESC LIMIT 1",
                rusqlite::params![content_type_id, pk],
                |r| r.get(0),
            )
            .optional()?;
        Ok(match version_id {
            None => true,
            Some(version_id) => version_id.is_some(),
        })
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Runs `f` inside a dialect-wrapped transaction: begin, then commit on
    /// `Ok`, rollback on `Err`. This is the low-level primitive; row-level
    /// tracking and extension firing happen above it in [`crate::tracking`].
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        self.dialect.begin(&conn)?;
        match f(&conn) {
            Ok(value) => {
                self.dialect.end(&conn, true)?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.dialect.end(&conn, false);
                Err(err)
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Toggles the listening flag for the lifetime of the returned guard,
    /// restoring the previous value on drop. Used to run a transaction
    /// (e.g. applying a pull or a repair) without re-recording its own
    /// writes as new local operations.
    pub fn with_listening(&self, enabled: bool) -> ListeningGuard<'_> {
        let previous = self.listening.swap(enabled, Ordering::SeqCst);
        ListeningGuard { engine: self, previous }
    }

    pub fn get_latest_version_id(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let value: Option<i64> = conn.query_row(
            "SELECT MAX(version_id) FROM sync_versions",
            [],
            |r| r.get(0),
        )?;
        Ok(value)
    }

    pub fn node_id(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT node_id FROM sync_identity WHERE id = 1", [], |r| r.get(0))
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(SyncError::from(other)),
            })
    }

    pub fn secret(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT secret FROM sync_identity WHERE id = 1", [], |r| r.get(0))
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(SyncError::from(other)),
            })
    }

    pub fn save_identity(&self, node_id: i64, secret: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_identity (id, node_id, secret) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET node_id = excluded.node_id, secret = excluded.secret",
            rusqlite::params![node_id, secret],
        )?;
        Ok(())
    }

    pub fn log_error(&self, source: &str, error: &str, node_id: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_logs (created, source, error, node_id) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![chrono::Utc::now().naive_utc().to_string(), source, error, node_id],
        )?;
        Ok(())
    }

    /// Registers a new client node with a freshly generated secret
    /// (server-side §4.6 register handler).
    pub fn register_node(&self, registry_user_id: Option<i64>) -> Result<crate::model::Node> {
        let secret = crate::message::generate_secret(128);
        let registered = chrono::Utc::now().naive_utc();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_nodes (registered, registry_user_id, secret) VALUES (?1, ?2, ?3)",
            rusqlite::params![registered.to_string(), registry_user_id, secret],
        )?;
        let node_id = conn.last_insert_rowid();
        Ok(crate::model::Node { node_id, registered, registry_user_id, secret })
    }

    pub fn node_secret(&self, node_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT secret FROM sync_nodes WHERE node_id = ?1", [node_id], |r| r.get(0))
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(SyncError::from(other)),
            })
    }

    /// Records that `node_id` has pulled up through `version_id`; gates
    /// server-side trim (a node that never acks blocks collection of the
    /// versions it hasn't seen yet).
    pub fn ack_node_version(&self, node_id: i64, version_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_nodes SET last_seen_version_id = ?1 WHERE node_id = ?2",
            rusqlite::params![version_id, node_id],
        )?;
        Ok(())
    }

    /// The last acknowledged version id of every registered node, `None`
    /// for one that has never pulled.
    pub fn node_acks(&self) -> Result<Vec<Option<i64>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT last_seen_version_id FROM sync_nodes")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(SyncError::from)
    }
}

/// RAII guard restoring the previous listening flag on drop.
pub struct ListeningGuard<'a> {
    engine: &'a Engine,
    previous: bool,
}

impl Drop for ListeningGuard<'_> {
    fn drop(&mut self) {
        self.engine.listening.store(self.previous, Ordering::SeqCst);
    }
}

/// Opens (or adopts) a connection and installs it as the process-wide
/// engine. Replaces any previously configured engine.
pub fn set_engine(conn: Connection, dialect: Box<dyn Dialect>) -> Result<()> {
    let engine = Engine::new(conn, dialect);
    engine.init_schema()?;
    *ENGINE.write().unwrap() = Some(Arc::new(engine));
    Ok(())
}

/// Tears down the process-wide engine. Idempotent.
pub fn drop_all() {
    *ENGINE.write().unwrap() = None;
}

/// Returns the process-wide engine, or [`SyncError::Configuration`] if
/// `set_engine` hasn't been called (or has been torn down since).
pub fn get_engine() -> Result<Arc<Engine>> {
    ENGINE.read().unwrap().clone().ok_or(SyncError::Configuration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ColumnDef, Row, TrackedTable};

    struct NullTable;

    impl TrackedTable for NullTable {
        fn model_name(&self) -> &'static str {
            "Null"
        }
        fn table_name(&self) -> &'static str {
            "nulls"
        }
        fn primary_key_column(&self) -> &'static str {
            "id"
        }
        fn columns(&self) -> &[ColumnDef] {
            &[]
        }
        fn load(&self, _conn: &Connection, _pk: i64) -> Result<Option<Row>> {
            Ok(None)
        }
        fn exists(&self, _conn: &Connection, _pk: i64) -> Result<bool> {
            Ok(false)
        }
        fn insert(&self, _conn: &Connection, _pk: i64, _row: &Row) -> Result<()> {
            Ok(())
        }
        fn update(&self, _conn: &Connection, _pk: i64, _row: &Row) -> Result<()> {
            Ok(())
        }
        fn delete(&self, _conn: &Connection, _pk: i64) -> Result<()> {
            Ok(())
        }
        fn max_pk(&self, _conn: &Connection) -> Result<Option<i64>> {
            Ok(None)
        }
        fn all_pks(&self, _conn: &Connection) -> Result<Vec<i64>> {
            Ok(vec![])
        }
        fn rows_referencing(&self, _conn: &Connection, _fk_column: &str, _pk: i64) -> Result<Vec<i64>> {
            Ok(vec![])
        }
        fn rewrite_fk(&self, _conn: &Connection, _fk_column: &str, _old_pk: i64, _new_pk: i64) -> Result<()> {
            Ok(())
        }
        fn find_by_unique(&self, _conn: &Connection, _columns: &[&'static str], _values: &Row, _exclude_pk: i64) -> Result<Option<i64>> {
            Ok(None)
        }
    }
    use crate::dialect::SqliteDialect;

    fn fresh() -> Arc<Engine> {
        drop_all();
        set_engine(Connection::open_in_memory().unwrap(), Box::new(SqliteDialect::new())).unwrap();
        get_engine().unwrap()
    }

    #[test]
    fn get_engine_before_set_errors() {
        drop_all();
        assert!(matches!(get_engine(), Err(SyncError::Configuration)));
    }

    #[test]
    fn identity_round_trips() {
        let engine = fresh();
        assert_eq!(engine.node_id().unwrap(), None);
        engine.save_identity(7, "s3cr3t").unwrap();
        assert_eq!(engine.node_id().unwrap(), Some(7));
        assert_eq!(engine.secret().unwrap(), Some("s3cr3t".to_string()));
        engine.save_identity(7, "rotated").unwrap();
        assert_eq!(engine.secret().unwrap(), Some("rotated".to_string()));
        drop_all();
    }

    #[test]
    fn listening_guard_restores_previous_value() {
        let engine = fresh();
        assert!(engine.is_listening());
        {
            let _guard = engine.with_listening(false);
            assert!(!engine.is_listening());
        }
        assert!(engine.is_listening());
        drop_all();
    }

    #[test]
    fn latest_version_id_is_none_when_empty() {
        let engine = fresh();
        assert_eq!(engine.get_latest_version_id().unwrap(), None);
        drop_all();
    }

    #[test]
    fn is_synced_true_for_untouched_row() {
        let engine = fresh();
        engine
            .register_model(Arc::new(NullTable), Direction::BOTH)
            .unwrap();
        assert!(engine.is_synced("Null", 1).unwrap());
        drop_all();
    }

    #[test]
    fn is_synced_false_while_pending_then_true_once_versioned() {
        let engine = fresh();
        engine
            .register_model(Arc::new(NullTable), Direction::BOTH)
            .unwrap();
        let ct = crate::registry::content_type_id("Null", "nulls");
        {
            let conn = engine.conn();
            conn.execute(
                "INSERT INTO sync_operations (row_id, content_type_id, command, version_id) VALUES (1, ?1, 'i', NULL)",
                rusqlite::params![ct],
            )
            .unwrap();
        }
        assert!(!engine.is_synced("Null", 1).unwrap());
        {
            let conn = engine.conn();
            conn.execute(
                "INSERT INTO sync_versions (node_id, created) VALUES (NULL, '2024-01-01T00:00:00')",
                [],
            )
            .unwrap();
            conn.execute(
                "UPDATE sync_operations SET version_id = 1 WHERE content_type_id = ?1 AND row_id = 1",
                rusqlite::params![ct],
            )
            .unwrap();
        }
        assert!(engine.is_synced("Null", 1).unwrap());
        drop_all();
    }

    #[test]
    fn is_synced_errors_for_untracked_model() {
        let engine = fresh();
        assert!(engine.is_synced("Nonexistent", 1).is_err());
        drop_all();
    }
}
