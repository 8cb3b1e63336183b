//! The server's push handler (spec §4.6): admission checks, unique-conflict
//! resolution, applying operations in order, and sealing them into a fresh
//! [`Version`].
//!
//! Admission runs in a fixed order because each check tells the client
//! something different: a stale `latest_version_id` means "pull first"
//! ([`SyncError::PullSuggested`]); anything after that is the client's own
//! fault and comes back as [`SyncError::PushRejected`].

use rusqlite::Connection;

use crate::engine::Engine;
use crate::error::{Result, SyncError};
use crate::merge::{decode_row, table_for};
use crate::message::base::find_object;
use crate::message::PushMessage;
use crate::model::{Command, Operation, Version};

use super::conflicts;

pub fn handle_push(engine: &Engine, message: &PushMessage) -> Result<Version> {
    match handle_push_inner(engine, message) {
        Ok(version) => Ok(version),
        Err(err) => {
            let _ = engine.log_error("push", &err.to_string(), Some(message.node_id));
            Err(err)
        }
    }
}

fn handle_push_inner(engine: &Engine, message: &PushMessage) -> Result<Version> {
    let latest = engine.get_latest_version_id()?;
    if message.latest_version_id != latest {
        return Err(SyncError::PullSuggested(format!(
            "client is at version {:?}, server is at {:?}",
            message.latest_version_id, latest
        )));
    }
    if message.operations.is_empty() {
        return Err(SyncError::PushRejected("push carries no operations".into()));
    }
    let secret = engine
        .node_secret(message.node_id)?
        .ok_or_else(|| SyncError::PushRejected(format!("unknown node {}", message.node_id)))?;
    if !message.is_legit(&secret) {
        return Err(SyncError::PushRejected("signature verification failed".into()));
    }

    engine.with_transaction(|conn| {
        let resolutions = conflicts::find_unique_conflicts(engine, conn, message)?;
        for resolution in &resolutions {
            let table = engine
                .registry()
                .by_model(&resolution.model_name)
                .cloned()
                .ok_or(SyncError::State("unknown model in unique resolution"))?;
            table.delete(conn, resolution.conflicting_pk)?;
        }

        let mut ordered = message.operations.clone();
        ordered.sort_by_key(|op| op.order);
        for op in &ordered {
            perform_operation(engine, conn, message, op)
                .map_err(|err| SyncError::PushRejected(format!("operation {}#{} failed: {err}", op.content_type_id, op.row_id)))?;
        }

        let created = chrono::Utc::now().naive_utc();
        conn.execute(
            "INSERT INTO sync_versions (node_id, created) VALUES (?1, ?2)",
            rusqlite::params![message.node_id, created.to_string()],
        )?;
        let version_id = conn.last_insert_rowid();

        for op in &ordered {
            conn.execute(
                "INSERT INTO sync_operations (row_id, content_type_id, command, version_id) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![op.row_id, op.content_type_id, op.command.as_char().to_string(), version_id],
            )?;
        }

        Ok(Version { version_id, node_id: Some(message.node_id), created })
    })
}

fn perform_operation(engine: &Engine, conn: &Connection, message: &PushMessage, op: &Operation) -> Result<()> {
    let table = table_for(engine, op.content_type_id)?;
    match op.command {
        Command::Insert | Command::Update => {
            let object = find_object(message.payload(), table.model_name(), op.row_id)
                .ok_or_else(|| SyncError::Operation("missing payload row".into()))?;
            let row = decode_row(table.as_ref(), object)?;
            if op.command == Command::Insert {
                table.insert(conn, op.row_id, &row)?;
            } else {
                table.update(conn, op.row_id, &row)?;
            }
        }
        Command::Delete => {
            table.delete(conn, op.row_id)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::dialect::SqliteDialect;
    use crate::engine::{drop_all, get_engine, set_engine};
    use crate::registry::{ColumnDef, Direction, Row, TrackedTable};

    use super::*;

    struct Things;

    impl TrackedTable for Things {
        fn model_name(&self) -> &'static str {
            "Thing"
        }
        fn table_name(&self) -> &'static str {
            "things"
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

    fn setup() -> Arc<Engine> {
        drop_all();
        set_engine(Connection::open_in_memory().unwrap(), Box::new(SqliteDialect::new())).unwrap();
        let engine = get_engine().unwrap();
        engine.register_model(Arc::new(Things), Direction::BOTH).unwrap();
        engine
    }

    #[test]
    fn stale_latest_version_id_suggests_pull() {
        let engine = setup();
        let msg = PushMessage::new(chrono::Utc::now().naive_utc(), 1, Some(99));
        let err = handle_push(&engine, &msg).unwrap_err();
        assert!(matches!(err, SyncError::PullSuggested(_)));
        drop_all();
    }

    #[test]
    fn rejection_is_recorded_in_sync_logs() {
        let engine = setup();
        let msg = PushMessage::new(chrono::Utc::now().naive_utc(), 1, None);
        let _ = handle_push(&engine, &msg).unwrap_err();
        let conn = engine.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_logs", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
        drop_all();
    }

    #[test]
    fn unknown_node_is_rejected() {
        let engine = setup();
        let mut msg = PushMessage::new(chrono::Utc::now().naive_utc(), 42, None);
        msg.add_operation(Operation { order: 1, row_id: 1, content_type_id: 1, command: Command::Insert, version_id: None });
        let err = handle_push(&engine, &msg).unwrap_err();
        assert!(matches!(err, SyncError::PushRejected(_)));
        drop_all();
    }
}
