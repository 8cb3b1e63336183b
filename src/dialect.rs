//! DBMS-specific transaction setup. Only SQLite is ever exercised by this
//! crate (rusqlite has no other backend), but the dispatch shape mirrors
//! the original multi-dialect design so a non-SQLite `Dialect` can be
//! dropped in without touching the engine.

use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::Connection;

use crate::error::Result;

/// Per-DBMS hooks run around a sync transaction: relaxing foreign-key
/// enforcement for the duration of a merge (which may transiently violate
/// FKs while renumbering) and taking the strongest available lock so two
/// local writers can't interleave with a sync cycle.
pub trait Dialect: Send + Sync {
    fn begin(&self, conn: &Connection) -> Result<()>;
    fn end(&self, conn: &Connection, commit: bool) -> Result<()>;
}

/// SQLite: snapshot `PRAGMA foreign_keys`, disable it, and take an
/// exclusive lock up front rather than letting it upgrade mid-transaction.
#[derive(Default)]
pub struct SqliteDialect {
    saved_fk: AtomicBool,
}

impl SqliteDialect {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Dialect for SqliteDialect {
    fn begin(&self, conn: &Connection) -> Result<()> {
        let fk_on: i64 = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0))?;
        self.saved_fk.store(fk_on != 0, Ordering::SeqCst);
        conn.execute_batch("PRAGMA foreign_keys = OFF; BEGIN EXCLUSIVE TRANSACTION;")?;
        Ok(())
    }

    fn end(&self, conn: &Connection, commit: bool) -> Result<()> {
        conn.execute_batch(if commit { "COMMIT;" } else { "ROLLBACK;" })?;
        let restore = self.saved_fk.load(Ordering::SeqCst);
        conn.execute_batch(&format!(
            "PRAGMA foreign_keys = {}",
            if restore { "ON" } else { "OFF" }
        ))?;
        Ok(())
    }
}

/// No-op dialect for DBMSs with no special transaction setup.
#[derive(Default)]
pub struct NullDialect;

impl Dialect for NullDialect {
    fn begin(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch("BEGIN TRANSACTION;")?;
        Ok(())
    }

    fn end(&self, conn: &Connection, commit: bool) -> Result<()> {
        conn.execute_batch(if commit { "COMMIT;" } else { "ROLLBACK;" })?;
        Ok(())
    }
}

/// Fast path for the next local primary key: SQLite tracks the high-water
/// mark for `AUTOINCREMENT` tables in `sqlite_sequence`, which is cheaper
/// than `MAX(pk)` on a large table. Falls back to `None` (caller should
/// then query `MAX(pk)` itself) when the table isn't in that registry,
/// e.g. because it was never declared `AUTOINCREMENT` or is still empty.
pub fn max_local_fast(conn: &Connection, table_name: &str) -> Result<Option<i64>> {
    let value: Option<i64> = conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = ?1",
            [table_name],
            |r| r.get(0),
        )
        .ok();
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_dialect_round_trips_fk_pragma() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        let dialect = SqliteDialect::new();
        dialect.begin(&conn).unwrap();
        let mid: i64 = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0)).unwrap();
        assert_eq!(mid, 0);
        dialect.end(&conn, true).unwrap();
        let restored: i64 = conn.query_row("PRAGMA foreign_keys", [], |r| r.get(0)).unwrap();
        assert_eq!(restored, 1);
    }
}
