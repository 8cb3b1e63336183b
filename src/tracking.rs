//! Client-side change tracking (spec §4.2/§4.3).
//!
//! The original relies on SQLAlchemy's `after_insert`/`after_update`/
//! `after_delete` mapper events to queue operations automatically. Without
//! an ORM to hook into, callers make the three mutations explicit --
//! `insert_tracked`/`update_tracked`/`delete_tracked` -- mirroring the
//! teacher crate's own `log_insert_fullrow`/`log_update`/`log_delete` calls.
//!
//! A model registered with `Direction::PULL_ONLY` never appends an
//! operation here, even though the row mutation itself still happens --
//! pull-only models take remote changes but never originate their own.

use std::sync::Arc;

use rusqlite::Connection;

use crate::engine::Engine;
use crate::error::{Result, SyncError};
use crate::model::{Command, Operation};
use crate::registry::{Row, TrackedTable};

/// A handle for recording tracked mutations inside one transaction.
/// Obtained from [`with_transaction`].
pub struct SyncTransaction<'e> {
    engine: &'e Engine,
    conn: &'e Connection,
}

impl<'e> SyncTransaction<'e> {
    fn table(&self, model_name: &str) -> Result<Arc<dyn TrackedTable>> {
        self.engine
            .registry()
            .by_model(model_name)
            .cloned()
            .ok_or(SyncError::State("unknown tracked model"))
    }

    pub fn insert_tracked(&self, model_name: &str, pk: i64, row: &Row) -> Result<()> {
        let table = self.table(model_name)?;
        table.insert(self.conn, pk, row)?;
        if self.should_log(model_name) {
            self.log_op(model_name, pk, Command::Insert)?;
        }
        self.engine.extensions().save_extensions(self.conn, model_name, pk, row);
        Ok(())
    }

    /// Updates a tracked row. Skips logging (but still performs the write)
    /// when the new row is identical to what's currently stored -- a
    /// no-op update shouldn't occupy a slot in the operation log. The
    /// delete-equivalent extension hook still fires on a real change,
    /// since a virtual field computed from the prior row can become
    /// stale on an update just as much as on a delete.
    pub fn update_tracked(&self, model_name: &str, pk: i64, row: &Row) -> Result<()> {
        let table = self.table(model_name)?;
        let previous = table.load(self.conn, pk)?;
        table.update(self.conn, pk, row)?;
        let changed = previous.as_ref() != Some(row);
        if changed && self.should_log(model_name) {
            self.log_op(model_name, pk, Command::Update)?;
        }
        if let Some(previous) = &previous {
            if changed {
                self.engine.extensions().delete_extensions(self.conn, model_name, pk, previous, Some(row));
            }
        }
        self.engine.extensions().save_extensions(self.conn, model_name, pk, row);
        Ok(())
    }

    pub fn delete_tracked(&self, model_name: &str, pk: i64) -> Result<()> {
        let table = self.table(model_name)?;
        let previous = table.load(self.conn, pk)?;
        table.delete(self.conn, pk)?;
        if self.should_log(model_name) {
            self.log_op(model_name, pk, Command::Delete)?;
        }
        if let Some(previous) = &previous {
            self.engine.extensions().delete_extensions(self.conn, model_name, pk, previous, None);
        }
        Ok(())
    }

    fn should_log(&self, model_name: &str) -> bool {
        self.engine.is_listening() && self.engine.registry().is_pushed(model_name)
    }

    fn log_op(&self, model_name: &str, pk: i64, command: Command) -> Result<()> {
        let content_type_id = self
            .engine
            .registry()
            .content_type_id_of(model_name)
            .ok_or(SyncError::State("unknown tracked model"))?;
        self.conn.execute(
            "INSERT INTO sync_operations (row_id, content_type_id, command, version_id)
             VALUES (?1, ?2, ?3, NULL)",
            rusqlite::params![pk, content_type_id, command.as_char().to_string()],
        )?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        self.conn
    }
}

/// Runs `f` inside a dialect-wrapped transaction, handing it a
/// [`SyncTransaction`] for recording tracked mutations.
pub fn with_transaction<T>(engine: &Engine, f: impl FnOnce(&SyncTransaction) -> Result<T>) -> Result<T> {
    engine.with_transaction(|conn| {
        let tx = SyncTransaction { engine, conn };
        f(&tx)
    })
}

/// All operations not yet attached to a version, in append order.
pub fn pending_operations(engine: &Engine) -> Result<Vec<Operation>> {
    let conn = engine.conn();
    let mut stmt = conn.prepare(
        "SELECT \"order\", row_id, content_type_id, command, version_id
         FROM sync_operations WHERE version_id IS NULL ORDER BY \"order\" ASC",
    )?;
    let rows = stmt.query_map([], row_to_operation)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(SyncError::from)
}

/// Attaches every still-unversioned operation up to and including
/// `upto_order` to `version_id`, once a push has been acknowledged.
pub fn attach_version(engine: &Engine, version_id: i64, upto_order: i64) -> Result<()> {
    let conn = engine.conn();
    conn.execute(
        "UPDATE sync_operations SET version_id = ?1 WHERE version_id IS NULL AND \"order\" <= ?2",
        rusqlite::params![version_id, upto_order],
    )?;
    Ok(())
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Operation> {
    let command_str: String = row.get(3)?;
    let command = Command::from_char(command_str.chars().next().unwrap_or('?')).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, "bad command".into())
    })?;
    Ok(Operation {
        order: row.get(0)?,
        row_id: row.get(1)?,
        content_type_id: row.get(2)?,
        command,
        version_id: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SqlValue;
    use crate::dialect::SqliteDialect;
    use crate::engine::{drop_all, get_engine, set_engine};
    use crate::registry::{ColumnDef, Direction, ForeignKeyDef};
    use std::collections::BTreeMap;

    struct Widgets;

    impl TrackedTable for Widgets {
        fn model_name(&self) -> &'static str {
            "Widget"
        }
        fn table_name(&self) -> &'static str {
            "widgets"
        }
        fn primary_key_column(&self) -> &'static str {
            "id"
        }
        fn columns(&self) -> &[ColumnDef] {
            &[]
        }
        fn load(&self, conn: &Connection, pk: i64) -> Result<Option<Row>> {
            conn.query_row("SELECT name FROM widgets WHERE id = ?1", [pk], |r| {
                let name: String = r.get(0)?;
                Ok(name)
            })
            .map(|name| {
                let mut row = Row::new();
                row.insert("name".into(), SqlValue::Text(name));
                Some(row)
            })
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(SyncError::from(other)),
            })
        }
        fn exists(&self, conn: &Connection, pk: i64) -> Result<bool> {
            Ok(self.load(conn, pk)?.is_some())
        }
        fn insert(&self, conn: &Connection, pk: i64, row: &Row) -> Result<()> {
            let name = match row.get("name") {
                Some(SqlValue::Text(s)) => s.clone(),
                _ => String::new(),
            };
            conn.execute("INSERT INTO widgets (id, name) VALUES (?1, ?2)", rusqlite::params![pk, name])?;
            Ok(())
        }
        fn update(&self, conn: &Connection, pk: i64, row: &Row) -> Result<()> {
            let name = match row.get("name") {
                Some(SqlValue::Text(s)) => s.clone(),
                _ => String::new(),
            };
            conn.execute("UPDATE widgets SET name = ?1 WHERE id = ?2", rusqlite::params![name, pk])?;
            Ok(())
        }
        fn delete(&self, conn: &Connection, pk: i64) -> Result<()> {
            conn.execute("DELETE FROM widgets WHERE id = ?1", [pk])?;
            Ok(())
        }
        fn max_pk(&self, conn: &Connection) -> Result<Option<i64>> {
            Ok(conn.query_row("SELECT MAX(id) FROM widgets", [], |r| r.get(0))?)
        }
        fn all_pks(&self, conn: &Connection) -> Result<Vec<i64>> {
            let mut stmt = conn.prepare("SELECT id FROM widgets")?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
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

    fn setup() -> Arc<Engine> {
        drop_all();
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE widgets (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
        set_engine(conn, Box::new(SqliteDialect::new())).unwrap();
        let engine = get_engine().unwrap();
        engine.register_model(Arc::new(Widgets), Direction::BOTH).unwrap();
        engine
    }

    fn row(name: &str) -> Row {
        let mut r = BTreeMap::new();
        r.insert("name".to_string(), SqlValue::Text(name.to_string()));
        r
    }

    #[test]
    fn insert_tracked_logs_one_operation() {
        let engine = setup();
        with_transaction(&engine, |tx| tx.insert_tracked("Widget", 1, &row("a"))).unwrap();
        let ops = pending_operations(&engine).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].command, Command::Insert);
        assert_eq!(ops[0].row_id, 1);
        drop_all();
    }

    #[test]
    fn pull_only_model_does_not_log() {
        let engine = setup();
        // re-register as pull-only to override direction
        engine.register_model(Arc::new(Widgets), Direction::PULL_ONLY).unwrap();
        with_transaction(&engine, |tx| tx.insert_tracked("Widget", 2, &row("b"))).unwrap();
        let ops = pending_operations(&engine).unwrap();
        assert!(ops.is_empty());
        drop_all();
    }

    #[test]
    fn no_op_update_is_not_logged() {
        let engine = setup();
        with_transaction(&engine, |tx| tx.insert_tracked("Widget", 3, &row("same"))).unwrap();
        with_transaction(&engine, |tx| tx.update_tracked("Widget", 3, &row("same"))).unwrap();
        let ops = pending_operations(&engine).unwrap();
        assert_eq!(ops.len(), 1);
        drop_all();
    }

    #[test]
    fn listening_off_suppresses_logging() {
        let engine = setup();
        {
            let _guard = engine.with_listening(false);
            with_transaction(&engine, |tx| tx.insert_tracked("Widget", 4, &row("c"))).unwrap();
        }
        assert!(pending_operations(&engine).unwrap().is_empty());
        drop_all();
    }
}
