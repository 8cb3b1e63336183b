//! Server-side log trimming (spec §4.10): once every node has acknowledged
//! a version, the operations and versions behind it no longer matter to
//! anyone and can be collected.
//!
//! A node that has never pulled (`last_seen_version_id` is `NULL`) blocks
//! trim outright -- there's no way to tell what it still needs.

use crate::engine::Engine;
use crate::error::Result;

/// Deletes operations and versions no node still needs. Returns the number
/// of versions removed.
pub fn trim(engine: &Engine) -> Result<usize> {
    let acks = engine.node_acks()?;
    if acks.iter().any(|ack| ack.is_none()) {
        return Ok(0);
    }

    let floor = match acks.iter().flatten().min().copied() {
        Some(floor) => floor,
        None => {
            // No registered nodes at all: keep only the latest version so a
            // freshly registered node still has somewhere to start from.
            match engine.get_latest_version_id()? {
                Some(latest) => latest,
                None => return Ok(0),
            }
        }
    };

    engine.with_transaction(|conn| {
        conn.execute("DELETE FROM sync_operations WHERE version_id <= ?1", [floor])?;
        let removed = conn.execute("DELETE FROM sync_versions WHERE version_id < ?1", [floor])?;
        Ok(removed)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rusqlite::Connection;

    use super::*;
    use crate::dialect::SqliteDialect;
    use crate::engine::{drop_all, get_engine, set_engine};
    use crate::registry::{ColumnDef, Direction, Row, TrackedTable};

    struct Items;

    impl TrackedTable for Items {
        fn model_name(&self) -> &'static str {
            "Item"
        }
        fn table_name(&self) -> &'static str {
            "items"
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

    fn setup() -> std::sync::Arc<Engine> {
        drop_all();
        set_engine(Connection::open_in_memory().unwrap(), Box::new(SqliteDialect::new())).unwrap();
        let engine = get_engine().unwrap();
        engine.register_model(Arc::new(Items), Direction::BOTH).unwrap();
        engine
    }

    fn push_version(engine: &Engine) -> i64 {
        let created = chrono::Utc::now().naive_utc();
        let conn = engine.conn();
        conn.execute(
            "INSERT INTO sync_versions (node_id, created) VALUES (NULL, ?1)",
            rusqlite::params![created.to_string()],
        )
        .unwrap();
        let version_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO sync_operations (row_id, content_type_id, command, version_id) VALUES (1, 1, 'i', ?1)",
            rusqlite::params![version_id],
        )
        .unwrap();
        version_id
    }

    #[test]
    fn blocks_when_a_node_never_acked() {
        let engine = setup();
        let node = engine.register_node(None).unwrap();
        push_version(&engine);
        let _ = node;
        assert_eq!(trim(&engine).unwrap(), 0);
        drop_all();
    }

    #[test]
    fn trims_up_to_minimum_ack() {
        let engine = setup();
        let node_a = engine.register_node(None).unwrap();
        let node_b = engine.register_node(None).unwrap();
        push_version(&engine);
        let v2 = push_version(&engine);
        push_version(&engine);
        engine.ack_node_version(node_a.node_id, v2).unwrap();
        engine.ack_node_version(node_b.node_id, v2).unwrap();
        let removed = trim(&engine).unwrap();
        assert_eq!(removed, 1);
        let conn = engine.conn();
        let remaining: i64 = conn.query_row("SELECT COUNT(*) FROM sync_versions", [], |r| r.get(0)).unwrap();
        assert_eq!(remaining, 2);
        drop_all();
    }

    #[test]
    fn no_nodes_keeps_latest_only() {
        let engine = setup();
        push_version(&engine);
        push_version(&engine);
        trim(&engine).unwrap();
        let conn = engine.conn();
        let remaining: i64 = conn.query_row("SELECT COUNT(*) FROM sync_versions", [], |r| r.get(0)).unwrap();
        assert_eq!(remaining, 1);
        drop_all();
    }
}
