//! Server-side read handlers (spec §4.7): incremental pull, full-snapshot
//! repair, ad-hoc query, and node registration.

use crate::codec;
use crate::engine::Engine;
use crate::error::Result;
use crate::message::base::{find_object, WrappedObject};
use crate::message::{PullMessage, PullRequestMessage, RegisterMessage};
use crate::model::{Command, Operation};
use crate::registry::{Row, TrackedTable};

fn wrap_row(table: &dyn TrackedTable, pk: i64, row: &Row) -> WrappedObject {
    let mut object = WrappedObject::new(table.model_name(), pk);
    for col in table.columns() {
        if let Some(value) = row.get(col.name) {
            object = object.with_field(col.name, codec::encode(value));
        }
    }
    object
}

/// Everything newer than the request's `latest_version_id`: operations,
/// the versions they belong to, and the current row each non-delete
/// operation touches.
pub fn handle_pull(engine: &Engine, request: &PullRequestMessage) -> Result<PullMessage> {
    let since = request.latest_version_id.unwrap_or(0);
    let mut message = PullMessage::new(chrono::Utc::now().naive_utc());

    let conn = engine.conn();
    let mut stmt = conn.prepare(
        "SELECT \"order\", row_id, content_type_id, command, version_id
         FROM sync_operations WHERE version_id > ?1 ORDER BY version_id ASC, \"order\" ASC",
    )?;
    let ops: Vec<Operation> = stmt
        .query_map([since], row_to_operation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    for op in &ops {
        if op.command == Command::Delete {
            continue;
        }
        let Some(table) = engine.registry().by_content_type(op.content_type_id).cloned() else { continue };
        if let Some(row) = table.load(&conn, op.row_id)? {
            message.add_object(wrap_row(table.as_ref(), op.row_id, &row));
        }
    }
    message.operations = ops;

    // Reversed-dependency hint: a row the client deleted locally might
    // still be a row another (unmodified, so not otherwise in this
    // window) row points at by foreign key. Ship its current data too, so
    // the client can resurrect it if its own conflict detection decides
    // to.
    for op in &request.operations {
        if op.command != Command::Delete {
            continue;
        }
        let Some(table) = engine.registry().by_content_type(op.content_type_id).cloned() else { continue };
        if find_object(message.payload(), table.model_name(), op.row_id).is_some() {
            continue;
        }
        if let Some(row) = table.load(&conn, op.row_id)? {
            message.add_object(wrap_row(table.as_ref(), op.row_id, &row));
        }
    }

    let mut vstmt = conn.prepare(
        "SELECT version_id, node_id, created FROM sync_versions WHERE version_id > ?1 ORDER BY version_id ASC",
    )?;
    let versions = vstmt
        .query_map([since], |r| {
            Ok(crate::model::Version {
                version_id: r.get(0)?,
                node_id: r.get(1)?,
                created: parse_naive(r.get::<_, String>(2)?),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    message.versions = versions;
    drop(vstmt);

    if let Some(node_id) = request.node_id {
        let current_latest: i64 = conn
            .query_row("SELECT COALESCE(MAX(version_id), 0) FROM sync_versions", [], |r| r.get(0))?;
        drop(conn);
        engine.ack_node_version(node_id, current_latest)?;
    }

    Ok(message)
}

/// A full snapshot of every tracked, pull-enabled model, to bootstrap (or
/// recover) a node instead of replaying its whole operation history.
pub fn handle_repair(engine: &Engine, exclude_extensions: bool) -> Result<(PullMessage, Option<i64>)> {
    let mut message = PullMessage::new(chrono::Utc::now().naive_utc());
    let conn = engine.conn();
    let tables: Vec<_> = engine
        .registry()
        .models()
        .filter(|t| engine.registry().is_pulled(t.model_name()))
        .cloned()
        .collect();
    for table in &tables {
        for pk in table.all_pks(&conn)? {
            let Some(row) = table.load(&conn, pk)? else { continue };
            let mut object = wrap_row(table.as_ref(), pk, &row);
            if !exclude_extensions {
                for (attr, value) in engine.extensions().load_extensions(&conn, table.model_name(), pk) {
                    object.fields.insert(attr, value);
                }
            }
            message.add_object(object);
        }
    }
    let latest: Option<i64> = conn.query_row("SELECT MAX(version_id) FROM sync_versions", [], |r| r.get(0))?;
    drop(conn);
    Ok((message, latest))
}

/// Ad-hoc equality query against one column of one tracked model (the
/// `<Model>_<column>=value` convention).
pub fn handle_query(engine: &Engine, model_name: &str, column: &str, value: &crate::codec::SqlValue) -> Result<Vec<WrappedObject>> {
    let Some(table) = engine.registry().by_model(model_name).cloned() else { return Ok(Vec::new()) };
    let conn = engine.conn();
    let mut out = Vec::new();
    for pk in table.find_by_column(&conn, column, value)? {
        if let Some(row) = table.load(&conn, pk)? {
            out.push(wrap_row(table.as_ref(), pk, &row));
        }
    }
    Ok(out)
}

pub fn handle_register(engine: &Engine, registry_user_id: Option<i64>) -> Result<RegisterMessage> {
    let node = engine.register_node(registry_user_id)?;
    Ok(RegisterMessage::new(node))
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Operation> {
    let command_str: String = row.get(3)?;
    let command = crate::model::Command::from_char(command_str.chars().next().unwrap_or('?')).ok_or_else(|| {
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

fn parse_naive(s: String) -> chrono::NaiveDateTime {
    chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f")
        .unwrap_or_else(|_| chrono::Utc::now().naive_utc())
}
